//! The runtime half of the machine: the object heap and the built-in
//! primitives the interpreter calls for every heap-producing or
//! heap-inspecting operation.
//!
//! The interpreter never touches object payloads directly; everything goes
//! through the methods here. Heap references handed out are opaque handles.
//! Objects live until process exit; the VM keeps the root contract (live
//! stack slice plus globals, with pops truncating) so a tracing collector
//! can be slotted in behind the allocation entry points.

use std::io::{BufRead, Write};

use crate::vm::{HeapRef, Kind, KindSet, Trap, Value};

/// Heap object tags, as the 3-bit header namespace defines them.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Tag {
	String,
	Array,
	Sexp,
	Closure,
}

/// Lengths are stored in 29 bits.
pub const MAX_OBJ_LEN: usize = (1 << 29) - 1;

/// The 64-symbol alphabet of the tag hash; a character's position is its
/// 6-bit code.
const TAG_CHARS: &[u8; 64] = b"_'abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// At most this many leading characters of a tag name are significant.
const TAG_HASH_CHARS: usize = 5;

const RENDER_DEPTH_LIMIT: usize = 32;

enum Obj {
	Str(Box<[u8]>),
	Array(Box<[Value]>),
	Sexp { tag: i32, items: Box<[Value]> },
	Closure { entry: usize, captures: Box<[Value]> },
}

impl Tag {
	fn kind(self) -> Kind {
		match self {
			Tag::String => Kind::String,
			Tag::Array => Kind::Array,
			Tag::Sexp => Kind::Sexp,
			Tag::Closure => Kind::Closure,
		}
	}
}

impl Obj {
	fn tag(&self) -> Tag {
		match self {
			Obj::Str(_) => Tag::String,
			Obj::Array(_) => Tag::Array,
			Obj::Sexp { .. } => Tag::Sexp,
			Obj::Closure { .. } => Tag::Closure,
		}
	}

	fn len(&self) -> usize {
		match self {
			Obj::Str(bytes) => bytes.len(),
			Obj::Array(items) => items.len(),
			Obj::Sexp { items, .. } => items.len(),
			// capture count + 1, counting the entry slot
			Obj::Closure { captures, .. } => captures.len() + 1,
		}
	}
}

/// Packs a constructor name into its 29-bit hash. Reversible via
/// [`Runtime::de_hash`] for names of up to five characters.
pub fn tag_hash(name: &str) -> Result<i32, Trap> {
	let mut hash = 0i32;
	for &byte in name.as_bytes().iter().take(TAG_HASH_CHARS) {
		let Some(code) = TAG_CHARS.iter().position(|&c| c == byte) else {
			return Err(Trap::BadTagChar { ch: byte as char });
		};
		hash = (hash << 6) | code as i32;
	}
	Ok(hash)
}

/// Recovers a constructor name from its hash.
pub fn de_hash(mut hash: i32) -> String {
	let mut chars = Vec::with_capacity(TAG_HASH_CHARS);
	while hash != 0 {
		chars.push(TAG_CHARS[(hash & 0x3F) as usize]);
		hash >>= 6;
	}
	chars.reverse();
	String::from_utf8(chars).expect("the tag alphabet is ASCII")
}

pub struct Runtime {
	objects: Vec<Obj>,
	input: Box<dyn BufRead>,
	output: Box<dyn Write>,
}

impl Default for Runtime {
	fn default() -> Self {
		Self::with_io(std::io::BufReader::new(std::io::stdin()), std::io::stdout())
	}
}

impl Runtime {
	pub fn with_io(input: impl BufRead + 'static, output: impl Write + 'static) -> Self {
		Self {
			objects: Vec::new(),
			input: Box::new(input),
			output: Box::new(output),
		}
	}

	fn obj(&self, handle: HeapRef) -> &Obj {
		&self.objects[handle.0]
	}

	fn obj_mut(&mut self, handle: HeapRef) -> &mut Obj {
		&mut self.objects[handle.0]
	}

	fn alloc(&mut self, obj: Obj) -> Result<Value, Trap> {
		if obj.len() > MAX_OBJ_LEN {
			return Err(Trap::ObjectTooLarge { len: obj.len() });
		}
		let handle = HeapRef(self.objects.len());
		self.objects.push(obj);
		Ok(Value::heap(handle))
	}

	/// The dynamic kind of a value, for trap reports.
	pub fn kind_of(&self, value: Value) -> Kind {
		if value.is_unboxed() {
			Kind::Int
		} else if value.is_dummy() {
			Kind::Dummy
		} else if value.is_slot() {
			Kind::StackRef
		} else {
			let handle = value.as_heap().expect("boxed, not a slot, not the dummy");
			self.obj(handle).tag().kind()
		}
	}

	fn expect_heap(&self, value: Value, expected: KindSet) -> Result<HeapRef, Trap> {
		value.as_heap().ok_or(Trap::Type { expected, got: self.kind_of(value) })
	}

	pub fn tag_of(&self, value: Value) -> Option<Tag> {
		value.as_heap().map(|h| self.obj(h).tag())
	}

	pub fn len_of(&self, handle: HeapRef) -> usize {
		self.obj(handle).len()
	}

	pub fn make_string(&mut self, contents: &str) -> Result<Value, Trap> {
		self.alloc(Obj::Str(contents.as_bytes().into()))
	}

	/// Fresh array of `n` slots; the caller fills the elements.
	pub fn make_array(&mut self, n: usize) -> Result<Value, Trap> {
		self.alloc(Obj::Array(vec![Value::UNIT; n].into()))
	}

	/// Fresh S-expression of `n` slots with the given tag hash; the caller
	/// fills the elements.
	pub fn make_sexp(&mut self, n: usize, tag: i32) -> Result<Value, Trap> {
		self.alloc(Obj::Sexp { tag, items: vec![Value::UNIT; n].into() })
	}

	pub fn make_closure(&mut self, entry: usize, captures: Vec<Value>) -> Result<Value, Trap> {
		self.alloc(Obj::Closure { entry, captures: captures.into() })
	}

	/// Fills element `i` of a fresh array or S-expression.
	pub fn set_elem(&mut self, handle: HeapRef, i: usize, value: Value) {
		match self.obj_mut(handle) {
			Obj::Array(items) | Obj::Sexp { items, .. } => items[i] = value,
			_ => unreachable!("set_elem is only used while constructing aggregates"),
		}
	}

	/// `a[i]`, dispatched on the tag of `a`.
	pub fn elem(&self, value: Value, index: i32) -> Result<Value, Trap> {
		const LEGAL: KindSet = KindSet::STRING.union(KindSet::ARRAY).union(KindSet::SEXP);
		let handle = self.expect_heap(value, LEGAL)?;
		let checked = |len: usize| match index >= 0 && (index as usize) < len {
			true => Ok(index as usize),
			false => Err(Trap::IndexOutOfBounds { index, len }),
		};
		match self.obj(handle) {
			Obj::Str(bytes) => {
				let i = checked(bytes.len())?;
				Ok(Value::int(bytes[i] as i32))
			},
			Obj::Array(items) => Ok(items[checked(items.len())?]),
			Obj::Sexp { items, .. } => Ok(items[checked(items.len())?]),
			Obj::Closure { .. } => {
				Err(Trap::Type { expected: LEGAL, got: Kind::Closure })
			},
		}
	}

	/// The array half of the indirect store; reference cells are handled by
	/// the stack.
	pub fn store_elem(&mut self, target: Value, index: i32, value: Value) -> Result<(), Trap> {
		let handle = self.expect_heap(target, KindSet::ARRAY | KindSet::STACK_REF)?;
		match self.obj_mut(handle) {
			Obj::Array(items) => {
				if index < 0 || index as usize >= items.len() {
					return Err(Trap::IndexOutOfBounds { index, len: items.len() });
				}
				items[index as usize] = value;
				Ok(())
			},
			other => Err(Trap::BadStoreTarget { got: other.tag().kind() }),
		}
	}

	pub fn length(&self, value: Value) -> Result<Value, Trap> {
		const LEGAL: KindSet = KindSet::STRING.union(KindSet::ARRAY).union(KindSet::SEXP);
		let handle = self.expect_heap(value, LEGAL)?;
		match self.obj(handle) {
			Obj::Str(bytes) => Ok(Value::int(bytes.len() as i32)),
			Obj::Array(items) => Ok(Value::int(items.len() as i32)),
			Obj::Sexp { items, .. } => Ok(Value::int(items.len() as i32)),
			Obj::Closure { .. } => Err(Trap::Type { expected: LEGAL, got: Kind::Closure }),
		}
	}

	fn render_into(&self, value: Value, out: &mut String, depth: usize) {
		if depth > RENDER_DEPTH_LIMIT {
			out.push_str("...");
			return;
		}
		if let Some(n) = value.as_int() {
			out.push_str(&n.to_string());
			return;
		}
		if value.is_dummy() || value.is_slot() {
			out.push_str("<ref>");
			return;
		}
		let handle = value.as_heap().expect("boxed, not a slot, not the dummy");
		match self.obj(handle) {
			Obj::Str(bytes) => out.push_str(&String::from_utf8_lossy(bytes)),
			Obj::Array(items) => {
				out.push('[');
				for (i, item) in items.iter().enumerate() {
					if i > 0 {
						out.push_str(", ");
					}
					self.render_into(*item, out, depth + 1);
				}
				out.push(']');
			},
			Obj::Sexp { tag, items } => {
				out.push_str(&de_hash(*tag));
				if !items.is_empty() {
					out.push_str(" (");
					for (i, item) in items.iter().enumerate() {
						if i > 0 {
							out.push_str(", ");
						}
						self.render_into(*item, out, depth + 1);
					}
					out.push(')');
				}
			},
			Obj::Closure { entry, .. } => {
				out.push_str(&format!("<closure {entry:#x}>"));
			},
		}
	}

	/// The printable representation of any value.
	pub fn render(&self, value: Value) -> String {
		let mut out = String::new();
		self.render_into(value, &mut out, 0);
		out
	}

	/// The string-conversion builtin: renders the operand and allocates the
	/// result.
	pub fn string_val(&mut self, value: Value) -> Result<Value, Trap> {
		let rendered = self.render(value);
		self.make_string(&rendered)
	}

	/// Is `value` an S-expression with this tag hash and arity?
	pub fn sexp_tag_test(&self, value: Value, tag: i32, n: usize) -> bool {
		match value.as_heap().map(|h| self.obj(h)) {
			Some(Obj::Sexp { tag: t, items }) => *t == tag && items.len() == n,
			_ => false,
		}
	}

	/// Is `value` an array of exactly `n` elements?
	pub fn array_test(&self, value: Value, n: usize) -> bool {
		match value.as_heap().map(|h| self.obj(h)) {
			Some(Obj::Array(items)) => items.len() == n,
			_ => false,
		}
	}

	/// Structural string equality; a non-string scrutinee answers no rather
	/// than trapping. The pattern operand must be a string.
	pub fn string_eq_test(&self, scrutinee: Value, pattern: Value) -> Result<bool, Trap> {
		let pattern_handle = self.expect_heap(pattern, KindSet::STRING)?;
		let Obj::Str(pattern_bytes) = self.obj(pattern_handle) else {
			return Err(Trap::Type { expected: KindSet::STRING, got: self.kind_of(pattern) });
		};
		match scrutinee.as_heap().map(|h| self.obj(h)) {
			Some(Obj::Str(bytes)) => Ok(bytes == pattern_bytes),
			_ => Ok(false),
		}
	}

	pub fn has_tag(&self, value: Value, tag: Tag) -> bool {
		self.tag_of(value) == Some(tag)
	}

	pub fn closure_entry(&self, value: Value) -> Result<usize, Trap> {
		let handle = self.expect_heap(value, KindSet::CLOSURE)?;
		match self.obj(handle) {
			Obj::Closure { entry, .. } => Ok(*entry),
			other => Err(Trap::Type { expected: KindSet::CLOSURE, got: other.tag().kind() }),
		}
	}

	/// The captured values of a closure, in capture order.
	pub fn closure_captures(&self, handle: HeapRef) -> Result<Vec<Value>, Trap> {
		match self.obj(handle) {
			Obj::Closure { captures, .. } => Ok(captures.to_vec()),
			other => Err(Trap::Type { expected: KindSet::CLOSURE, got: other.tag().kind() }),
		}
	}

	/// Writes a mutated capture back into its closure, so the change
	/// persists across calls.
	pub fn set_capture(&mut self, handle: HeapRef, i: usize, value: Value) {
		match self.obj_mut(handle) {
			Obj::Closure { captures, .. } => captures[i] = value,
			_ => unreachable!("set_capture is only reached through a checked closure"),
		}
	}

	/// Reads one line from the input handle and parses it as an integer.
	pub fn read_int(&mut self) -> Result<Value, Trap> {
		let mut line = String::new();
		let n = self.input.read_line(&mut line).map_err(|e| Trap::Io(e.to_string()))?;
		if n == 0 {
			return Err(Trap::Io("end of input while reading an integer".to_string()));
		}
		let trimmed = line.trim();
		let value = trimmed
			.parse::<i32>()
			.map_err(|_| Trap::Io(format!("not an integer: {trimmed:?}")))?;
		Ok(Value::int(value))
	}

	/// Prints one integer and a newline to the output handle.
	pub fn write_int(&mut self, n: i32) -> Result<(), Trap> {
		writeln!(self.output, "{n}").map_err(|e| Trap::Io(e.to_string()))?;
		self.output.flush().map_err(|e| Trap::Io(e.to_string()))
	}

	/// The trap raised by a failed match.
	pub fn match_failure(&self, value: Value, source: &str, line: u32, col: u32) -> Trap {
		Trap::MatchFailure {
			value: self.render(value),
			source: source.to_string(),
			line,
			col,
		}
	}
}
