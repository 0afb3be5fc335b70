//! The dispatch loop.
//!
//! One synchronous loop decodes and executes instructions until it reaches
//! the synthetic outer return ip (one past the last code byte), a `HALT`
//! byte, or a trap. Heap-producing opcodes allocate through the runtime
//! while their operands are still on the stack, so the root contract holds
//! at every allocation point.

use crate::raw::code::{is_prologue_byte, BinOp, Decoder, Instr, Pattern};
use crate::raw::image::Bytefile;
use crate::runtime::{tag_hash, Runtime, Tag};
use crate::vm::error::{KindSet, RuntimeError, Trap};
use crate::vm::stack::ValueStack;
use crate::vm::value::Value;

/// Mounts the image and runs it from `entry` to completion. Returns the
/// program's result value: what `main` returned, or the unboxed 0 when the
/// program stopped at an explicit halt.
pub fn run(
	file: &Bytefile,
	entry: u32,
	runtime: Runtime,
	source_name: &str,
) -> Result<Value, RuntimeError> {
	Interp::new(file, entry, runtime, source_name)?.eval()
}

fn string_at(file: &Bytefile, name: u32) -> Result<&str, Trap> {
	file.string(name).ok_or(Trap::StringIndex { index: name, size: file.stringtab_size() })
}

struct Interp<'l> {
	file: &'l Bytefile,
	code: &'l [u8],
	source_name: String,
	runtime: Runtime,
	stack: ValueStack,
	ip: usize,
	/// Return ip recorded by the latest call, consumed by the callee's
	/// prologue. Seeded with the outer return ip so `main`'s frame returns
	/// past the end of code.
	pending_ret_ip: usize,
}

impl<'l> Interp<'l> {
	fn new(
		file: &'l Bytefile,
		entry: u32,
		runtime: Runtime,
		source_name: &str,
	) -> Result<Self, RuntimeError> {
		let code = file.code();
		let outer = code.len();
		let mut stack = ValueStack::new(file.global_area_size() as usize, outer);

		// The entry prologue must see the same stack shape as any callee:
		// a capture count and a function slot.
		let init = stack
			.push(Value::int(0))
			.and_then(|_| stack.push_dummy());
		if let Err(trap) = init {
			return Err(RuntimeError { offset: entry, instr: String::new(), trap });
		}

		Ok(Self {
			file,
			code,
			source_name: source_name.to_string(),
			runtime,
			stack,
			ip: entry as usize,
			pending_ret_ip: outer,
		})
	}

	#[tracing::instrument(skip_all)]
	fn eval(mut self) -> Result<Value, RuntimeError> {
		loop {
			if self.ip >= self.code.len() {
				// the outermost return is intercepted at END; running off
				// the end of the region is a malformed program
				return Err(RuntimeError {
					offset: self.ip as u32,
					instr: String::from("?"),
					trap: Trap::EndOfCode,
				});
			}

			let offset = self.ip;
			let mut decoder = Decoder::at(self.code, offset);
			let instr = match decoder.next() {
				Ok(instr) => instr,
				Err(err) => {
					return Err(RuntimeError {
						offset: offset as u32,
						instr: String::from("?"),
						trap: Trap::Decode(err),
					})
				},
			};
			tracing::trace!(offset, %instr);
			self.ip = decoder.pos();

			match self.step(instr) {
				Ok(None) => {},
				Ok(Some(value)) => return Ok(value),
				Err(trap) => {
					return Err(RuntimeError {
						offset: offset as u32,
						instr: instr.to_string(),
						trap,
					})
				},
			}
		}
	}

	fn to_int(&self, value: Value) -> Result<i32, Trap> {
		value.as_int().ok_or(Trap::Type {
			expected: KindSet::INT,
			got: self.runtime.kind_of(value),
		})
	}

	fn target(&self, target: u32) -> Result<usize, Trap> {
		match (target as usize) < self.code.len() {
			true => Ok(target as usize),
			false => Err(Trap::JumpOutOfBounds { target, size: self.code.len() }),
		}
	}

	/// Validates a call destination: in bounds and on a `BEGIN`/`CBEGIN`.
	fn call_target(&self, entry: u32) -> Result<usize, Trap> {
		let entry = self.target(entry)?;
		match is_prologue_byte(self.code, entry) {
			true => Ok(entry),
			false => Err(Trap::CallTargetNotPrologue { target: entry as u32 }),
		}
	}

	fn binop(&mut self, op: BinOp) -> Result<(), Trap> {
		let rhs = self.to_int(self.stack.at(1)?)?;
		let lhs = self.to_int(self.stack.at(2)?)?;
		self.stack.pop(2)?;
		let result = match op {
			BinOp::Add => lhs.wrapping_add(rhs),
			BinOp::Sub => lhs.wrapping_sub(rhs),
			BinOp::Mul => lhs.wrapping_mul(rhs),
			BinOp::Div => {
				if rhs == 0 {
					return Err(Trap::DivisionByZero { lhs });
				}
				lhs.wrapping_div(rhs)
			},
			BinOp::Mod => {
				if rhs == 0 {
					return Err(Trap::ModuloByZero { lhs });
				}
				let rem = lhs.wrapping_rem(rhs);
				// the remainder is normalised into [0, |rhs|)
				match rem < 0 {
					true => rem.wrapping_add(rhs.wrapping_abs()),
					false => rem,
				}
			},
			BinOp::Lt => (lhs < rhs) as i32,
			BinOp::Le => (lhs <= rhs) as i32,
			BinOp::Gt => (lhs > rhs) as i32,
			BinOp::Ge => (lhs >= rhs) as i32,
			BinOp::Eq => (lhs == rhs) as i32,
			BinOp::Ne => (lhs != rhs) as i32,
			BinOp::And => (lhs != 0 && rhs != 0) as i32,
			BinOp::Or => (lhs != 0 || rhs != 0) as i32,
		};
		self.stack.push(Value::int(result))
	}

	/// Executes one instruction. `Some(value)` means the program finished.
	fn step(&mut self, instr: Instr<'_>) -> Result<Option<Value>, Trap> {
		match instr {
			Instr::Binop(op) => self.binop(op)?,

			Instr::Const(k) => self.stack.push(Value::int(k))?,

			Instr::Str { name } => {
				let contents = string_at(self.file, name)?;
				let value = self.runtime.make_string(contents)?;
				self.stack.push(value)?;
			},

			Instr::Sexp { name, n } => {
				let tag = tag_hash(string_at(self.file, name)?)?;
				let value = self.runtime.make_sexp(n as usize, tag)?;
				let handle = value.as_heap().expect("freshly allocated");
				for i in 0..n as usize {
					self.runtime.set_elem(handle, i, self.stack.at(n as usize - i)?);
				}
				self.stack.pop(n as usize)?;
				self.stack.push(value)?;
			},

			Instr::Sta => {
				let value = self.stack.at(1)?;
				let index = self.stack.at(2)?;
				let target = self.stack.at(3)?;
				self.stack.pop(3)?;
				if let Some(slot) = target.as_slot() {
					self.stack.set(slot, value)?;
				} else {
					self.runtime.store_elem(target, self.to_int(index)?, value)?;
				}
				self.stack.push(value)?;
			},

			Instr::Jmp { target } => self.ip = self.target(target)?,

			Instr::End => {
				if !self.stack.in_frame() {
					return Err(Trap::EndOutsideFrame);
				}
				let height = self.stack.height();
				if height != 1 {
					return Err(Trap::FrameImbalance { height });
				}
				let ci = *self.stack.frame();
				let fun = self.stack.get(ci.fun_index())?;
				if let Some(handle) = fun.as_heap() {
					if self.runtime.has_tag(fun, Tag::Closure) {
						for i in 0..ci.n_caps {
							let live = self.stack.get(ci.cap_index(i))?;
							self.runtime.set_capture(handle, i as usize, live);
						}
					}
				}
				let ci = self.stack.leave_frame()?;
				self.ip = ci.ret_ip;
				if self.ip == self.code.len() {
					// returned past the outermost frame
					return Ok(Some(self.stack.at(1)?));
				}
			},

			Instr::Drop => self.stack.pop(1)?,

			Instr::Dup => {
				let top = self.stack.at(1)?;
				self.stack.push(top)?;
			},

			Instr::Swap => {
				let a = self.stack.at(1)?;
				let b = self.stack.at(2)?;
				self.stack.set_at(1, b)?;
				self.stack.set_at(2, a)?;
			},

			Instr::Elem => {
				let index = self.to_int(self.stack.at(1)?)?;
				let aggregate = self.stack.at(2)?;
				self.stack.pop(2)?;
				let value = self.runtime.elem(aggregate, index)?;
				self.stack.push(value)?;
			},

			Instr::Ld(var) => {
				let value = self.stack.load(var)?;
				self.stack.push(value)?;
			},

			Instr::Lda(var) => {
				let index = self.stack.slot_index(var)?;
				self.stack.push(Value::slot(index))?;
				self.stack.push_dummy()?;
			},

			Instr::St(var) => {
				let value = self.stack.at(1)?;
				self.stack.store(var, value)?;
			},

			Instr::CJmpZ { target } => {
				let n = self.to_int(self.stack.at(1)?)?;
				self.stack.pop(1)?;
				let target = self.target(target)?;
				if n == 0 {
					self.ip = target;
				}
			},

			Instr::CJmpNz { target } => {
				let n = self.to_int(self.stack.at(1)?)?;
				self.stack.pop(1)?;
				let target = self.target(target)?;
				if n != 0 {
					self.ip = target;
				}
			},

			Instr::Begin { n_args, n_locs } => {
				let count = self.to_int(self.stack.at(2)?)?;
				if count != 0 {
					return Err(Trap::NonZeroCaptureCount { count });
				}
				let fun = self.stack.at(1)?;
				self.stack.pop(2)?;
				self.stack.enter_frame(0, n_args, n_locs, self.pending_ret_ip, fun, &[])?;
			},

			Instr::CBegin { n_args, n_locs, .. } => {
				// the static n_caps immediate is for the verifier; the
				// prologue trusts the count the caller pushed
				let count = self.to_int(self.stack.at(2)?)?;
				let fun = self.stack.at(1)?;
				self.stack.pop(2)?;
				let caps = match count {
					0 if fun.is_dummy() => Vec::new(),
					_ => {
						let handle = fun.as_heap().ok_or(Trap::Type {
							expected: KindSet::CLOSURE,
							got: self.runtime.kind_of(fun),
						})?;
						let caps = self.runtime.closure_captures(handle)?;
						if count < 0 || caps.len() != count as usize {
							return Err(Trap::CaptureCountMismatch {
								pushed: count,
								stored: caps.len(),
							});
						}
						caps
					},
				};
				self.stack.enter_frame(
					caps.len() as u32,
					n_args,
					n_locs,
					self.pending_ret_ip,
					fun,
					&caps,
				)?;
			},

			Instr::Closure { entry, captures } => {
				let entry = self.target(entry)?;
				let mut caps = Vec::with_capacity(captures.len());
				for var in captures.iter() {
					caps.push(self.stack.load(var)?);
				}
				let value = self.runtime.make_closure(entry, caps)?;
				self.stack.push(value)?;
			},

			Instr::CallC { n_args } => {
				let n = n_args as usize;
				let fun = self.stack.at(n + 1)?;
				let entry = self.runtime.closure_entry(fun)?;
				if entry >= self.code.len() || !is_prologue_byte(self.code, entry) {
					return Err(Trap::CallTargetNotPrologue { target: entry as u32 });
				}
				let handle = fun.as_heap().expect("closure_entry checked the tag");
				let n_caps = self.runtime.len_of(handle) - 1;
				self.stack.remove_under(n)?;
				self.stack.push(Value::int(n_caps as i32))?;
				self.stack.push(fun)?;
				self.pending_ret_ip = self.ip;
				self.ip = entry;
			},

			Instr::Call { entry, .. } => {
				let entry = self.call_target(entry)?;
				self.stack.push(Value::int(0))?;
				self.stack.push_dummy()?;
				self.pending_ret_ip = self.ip;
				self.ip = entry;
			},

			Instr::Tag { name, n } => {
				let tag = tag_hash(string_at(self.file, name)?)?;
				let value = self.stack.at(1)?;
				let test = self.runtime.sexp_tag_test(value, tag, n as usize);
				self.stack.set_at(1, Value::bool(test))?;
			},

			Instr::ArrayTest { n } => {
				let value = self.stack.at(1)?;
				let test = self.runtime.array_test(value, n as usize);
				self.stack.set_at(1, Value::bool(test))?;
			},

			Instr::Fail { line, col } => {
				let value = self.stack.at(1)?;
				return Err(self.runtime.match_failure(value, &self.source_name, line, col));
			},

			Instr::Line { .. } => {},

			Instr::Patt(Pattern::EqString) => {
				let pattern = self.stack.at(1)?;
				let scrutinee = self.stack.at(2)?;
				self.stack.pop(1)?;
				let test = self.runtime.string_eq_test(scrutinee, pattern)?;
				self.stack.set_at(1, Value::bool(test))?;
			},

			Instr::Patt(pattern) => {
				let value = self.stack.at(1)?;
				let test = match pattern {
					Pattern::String => self.runtime.has_tag(value, Tag::String),
					Pattern::Array => self.runtime.has_tag(value, Tag::Array),
					Pattern::Sexp => self.runtime.has_tag(value, Tag::Sexp),
					Pattern::Closure => self.runtime.has_tag(value, Tag::Closure),
					Pattern::Boxed => !value.is_unboxed(),
					Pattern::Unboxed => value.is_unboxed(),
					Pattern::EqString => unreachable!("handled above"),
				};
				self.stack.set_at(1, Value::bool(test))?;
			},

			Instr::CallRead => {
				let value = self.runtime.read_int()?;
				self.stack.push(value)?;
			},

			Instr::CallWrite => {
				let n = self.to_int(self.stack.at(1)?)?;
				self.stack.pop(1)?;
				self.runtime.write_int(n)?;
				self.stack.push(Value::UNIT)?;
			},

			Instr::CallLength => {
				let value = self.stack.at(1)?;
				let length = self.runtime.length(value)?;
				self.stack.set_at(1, length)?;
			},

			Instr::CallString => {
				let value = self.stack.at(1)?;
				let string = self.runtime.string_val(value)?;
				self.stack.set_at(1, string)?;
			},

			Instr::CallArray { n } => {
				let value = self.runtime.make_array(n as usize)?;
				let handle = value.as_heap().expect("freshly allocated");
				for i in 0..n as usize {
					self.runtime.set_elem(handle, i, self.stack.at(n as usize - i)?);
				}
				self.stack.pop(n as usize)?;
				self.stack.push(value)?;
			},

			Instr::Halt => return Ok(Some(Value::UNIT)),
		}

		Ok(None)
	}
}
