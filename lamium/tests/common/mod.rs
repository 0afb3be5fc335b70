//! In-memory bytecode assembly for black-box tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io::{Cursor, Write};
use std::rc::Rc;

use lamium::raw::code::{Pattern, VarKind};
use lamium::runtime::Runtime;
use lamium::vm::{self, RuntimeError, Value};
use lamium::Bytefile;

/// Builds a bytecode image instruction by instruction. Methods that carry a
/// patchable code offset return the position of that immediate so forward
/// jumps can be fixed up with [`Asm::patch`].
pub struct Asm {
	code: Vec<u8>,
	strings: Vec<u8>,
	publics: Vec<(u32, u32)>,
	globals: u32,
}

impl Asm {
	pub fn new() -> Self {
		Self {
			code: Vec::new(),
			strings: Vec::new(),
			publics: Vec::new(),
			globals: 0,
		}
	}

	pub fn globals(&mut self, n: u32) -> &mut Self {
		self.globals = n;
		self
	}

	/// Appends a NUL-terminated string and returns its table offset.
	pub fn intern(&mut self, s: &str) -> u32 {
		let offset = self.strings.len() as u32;
		self.strings.extend_from_slice(s.as_bytes());
		self.strings.push(0);
		offset
	}

	pub fn public(&mut self, name: &str, offset: u32) -> &mut Self {
		let name = self.intern(name);
		self.publics.push((name, offset));
		self
	}

	/// Current code offset.
	pub fn here(&self) -> u32 {
		self.code.len() as u32
	}

	pub fn byte(&mut self, byte: u8) -> &mut Self {
		self.code.push(byte);
		self
	}

	/// Emits a raw 32-bit immediate; for malformed-image tests.
	pub fn word(&mut self, value: u32) -> &mut Self {
		self.imm(value);
		self
	}

	fn imm(&mut self, value: u32) -> usize {
		let at = self.code.len();
		self.code.extend_from_slice(&value.to_le_bytes());
		at
	}

	/// Overwrites a previously emitted immediate.
	pub fn patch(&mut self, at: usize, value: u32) {
		self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
	}

	pub fn binop(&mut self, symbol: &str) -> &mut Self {
		let code = match symbol {
			"+" => 1,
			"-" => 2,
			"*" => 3,
			"/" => 4,
			"%" => 5,
			"<" => 6,
			"<=" => 7,
			">" => 8,
			">=" => 9,
			"==" => 10,
			"!=" => 11,
			"&&" => 12,
			"||" => 13,
			_ => panic!("unknown binop {symbol:?}"),
		};
		self.byte(code)
	}

	pub fn const_(&mut self, n: i32) -> &mut Self {
		self.byte(0x10);
		self.imm(n as u32);
		self
	}

	pub fn string(&mut self, s: &str) -> &mut Self {
		let name = self.intern(s);
		self.byte(0x11);
		self.imm(name);
		self
	}

	pub fn sexp(&mut self, tag: &str, n: u32) -> &mut Self {
		let name = self.intern(tag);
		self.byte(0x12);
		self.imm(name);
		self.imm(n);
		self
	}

	pub fn sta(&mut self) -> &mut Self {
		self.byte(0x14)
	}

	pub fn jmp(&mut self, target: u32) -> usize {
		self.byte(0x15);
		self.imm(target)
	}

	pub fn end(&mut self) -> &mut Self {
		self.byte(0x16)
	}

	pub fn drop_(&mut self) -> &mut Self {
		self.byte(0x18)
	}

	pub fn dup(&mut self) -> &mut Self {
		self.byte(0x19)
	}

	pub fn swap(&mut self) -> &mut Self {
		self.byte(0x1a)
	}

	pub fn elem(&mut self) -> &mut Self {
		self.byte(0x1b)
	}

	pub fn ld(&mut self, kind: VarKind, index: u32) -> &mut Self {
		self.byte(0x20 | kind as u8);
		self.imm(index);
		self
	}

	pub fn lda(&mut self, kind: VarKind, index: u32) -> &mut Self {
		self.byte(0x30 | kind as u8);
		self.imm(index);
		self
	}

	pub fn st(&mut self, kind: VarKind, index: u32) -> &mut Self {
		self.byte(0x40 | kind as u8);
		self.imm(index);
		self
	}

	pub fn cjmp_z(&mut self, target: u32) -> usize {
		self.byte(0x50);
		self.imm(target)
	}

	pub fn cjmp_nz(&mut self, target: u32) -> usize {
		self.byte(0x51);
		self.imm(target)
	}

	pub fn begin(&mut self, n_args: u32, n_locs: u32) -> &mut Self {
		self.byte(0x52);
		self.imm(n_args);
		self.imm(n_locs);
		self
	}

	pub fn cbegin(&mut self, n_caps: u32, n_args: u32, n_locs: u32) -> &mut Self {
		self.byte(0x53);
		self.imm(n_caps);
		self.imm(n_args);
		self.imm(n_locs);
		self
	}

	pub fn closure(&mut self, entry: u32, captures: &[(VarKind, u32)]) -> usize {
		self.byte(0x54);
		let at = self.imm(entry);
		self.imm(captures.len() as u32);
		for &(kind, index) in captures {
			self.byte(kind as u8);
			self.imm(index);
		}
		at
	}

	pub fn call_c(&mut self, n_args: u32) -> &mut Self {
		self.byte(0x55);
		self.imm(n_args);
		self
	}

	pub fn call(&mut self, entry: u32, n_args: u32) -> usize {
		self.byte(0x56);
		let at = self.imm(entry);
		self.imm(n_args);
		at
	}

	pub fn tag(&mut self, name: &str, n: u32) -> &mut Self {
		let name = self.intern(name);
		self.byte(0x57);
		self.imm(name);
		self.imm(n);
		self
	}

	pub fn array_test(&mut self, n: u32) -> &mut Self {
		self.byte(0x58);
		self.imm(n);
		self
	}

	pub fn fail(&mut self, line: u32, col: u32) -> &mut Self {
		self.byte(0x59);
		self.imm(line);
		self.imm(col);
		self
	}

	pub fn line(&mut self, line: u32) -> &mut Self {
		self.byte(0x5a);
		self.imm(line);
		self
	}

	pub fn patt(&mut self, pattern: Pattern) -> &mut Self {
		self.byte(0x60 | pattern as u8)
	}

	pub fn read(&mut self) -> &mut Self {
		self.byte(0x70)
	}

	pub fn write(&mut self) -> &mut Self {
		self.byte(0x71)
	}

	pub fn length(&mut self) -> &mut Self {
		self.byte(0x72)
	}

	pub fn string_val(&mut self) -> &mut Self {
		self.byte(0x73)
	}

	pub fn array_ctor(&mut self, n: u32) -> &mut Self {
		self.byte(0x74);
		self.imm(n);
		self
	}

	pub fn halt(&mut self) -> &mut Self {
		self.byte(0xF0)
	}

	/// Serialises the image.
	pub fn build(&self) -> Vec<u8> {
		let mut bytes = Vec::new();
		bytes.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
		bytes.extend_from_slice(&self.globals.to_le_bytes());
		bytes.extend_from_slice(&(self.publics.len() as u32).to_le_bytes());
		for &(name, offset) in &self.publics {
			bytes.extend_from_slice(&name.to_le_bytes());
			bytes.extend_from_slice(&offset.to_le_bytes());
		}
		bytes.extend_from_slice(&self.strings);
		bytes.extend_from_slice(&self.code);
		bytes
	}

	pub fn file(&self) -> Bytefile {
		Bytefile::load(&self.build()).expect("assembled image loads")
	}
}

/// A writer that can be handed to the runtime and read back afterwards.
#[derive(Clone, Default)]
pub struct SharedOut(Rc<RefCell<Vec<u8>>>);

impl SharedOut {
	pub fn contents(&self) -> String {
		String::from_utf8(self.0.borrow().clone()).expect("output is UTF-8")
	}
}

impl Write for SharedOut {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.0.borrow_mut().extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

/// Runs the image's `main` with the given stdin contents; returns the
/// result and everything the program printed.
pub fn run_with_io(file: &Bytefile, input: &str) -> (Result<Value, RuntimeError>, String) {
	let out = SharedOut::default();
	let runtime = Runtime::with_io(Cursor::new(input.as_bytes().to_vec()), out.clone());
	let entry = file.entry_offset().expect("image has an entry symbol");
	let result = vm::run(file, entry, runtime, "test.bc");
	(result, out.contents())
}

/// Runs an image that performs no I/O.
pub fn run(file: &Bytefile) -> Result<Value, RuntimeError> {
	run_with_io(file, "").0
}
