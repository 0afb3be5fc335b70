use std::fmt::{Display, Formatter};

use bitflags::bitflags;

use crate::raw::code::{DecodeError, VarKind};

/// The dynamic kind of a stack value, for trap reports.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
	Int,
	String,
	Array,
	Sexp,
	Closure,
	StackRef,
	Dummy,
}

bitflags! {
	/// A set of [`Kind`]s, used to report what an operation would have
	/// accepted.
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct KindSet: u8 {
		const INT = 0x01;
		const STRING = 0x02;
		const ARRAY = 0x04;
		const SEXP = 0x08;
		const CLOSURE = 0x10;
		const STACK_REF = 0x20;
		const DUMMY = 0x40;
	}
}

impl Kind {
	pub fn name(self) -> &'static str {
		match self {
			Self::Int => "int",
			Self::String => "string",
			Self::Array => "array",
			Self::Sexp => "sexp",
			Self::Closure => "closure",
			Self::StackRef => "stack reference",
			Self::Dummy => "dummy",
		}
	}
}

impl Display for Kind {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.name())
	}
}

impl Display for KindSet {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let names = [
			(Self::INT, "int"),
			(Self::STRING, "string"),
			(Self::ARRAY, "array"),
			(Self::SEXP, "sexp"),
			(Self::CLOSURE, "closure"),
			(Self::STACK_REF, "stack reference"),
			(Self::DUMMY, "dummy"),
		];
		let mut first = true;
		for (flag, name) in names {
			if self.contains(flag) {
				if !first {
					f.write_str("|")?;
				}
				f.write_str(name)?;
				first = false;
			}
		}
		Ok(())
	}
}

/// A fatal condition raised during interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum Trap {
	Decode(DecodeError),
	DivisionByZero { lhs: i32 },
	ModuloByZero { lhs: i32 },
	Type { expected: KindSet, got: Kind },
	StackUnderflow { needed: usize, available: usize },
	StackOverflow { limit: usize },
	OutOfFrame { kind: VarKind, index: u32, max: u32 },
	StringIndex { index: u32, size: u32 },
	JumpOutOfBounds { target: u32, size: usize },
	CallTargetNotPrologue { target: u32 },
	NonZeroCaptureCount { count: i32 },
	CaptureCountMismatch { pushed: i32, stored: usize },
	BadStoreTarget { got: Kind },
	ObjectTooLarge { len: usize },
	IndexOutOfBounds { index: i32, len: usize },
	FrameImbalance { height: usize },
	EndOutsideFrame,
	BadTagChar { ch: char },
	MatchFailure { value: String, source: String, line: u32, col: u32 },
	EndOfCode,
	Io(String),
}

impl Display for Trap {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Decode(err) => Display::fmt(err, f),
			Self::DivisionByZero { lhs } => write!(f, "division by zero: {lhs} / 0"),
			Self::ModuloByZero { lhs } => write!(f, "modulo by zero: {lhs} % 0"),
			Self::Type { expected, got } => write!(f, "expected {expected}, got {got}"),
			Self::StackUnderflow { needed, available } => {
				write!(f, "stack underflow: need {needed} values, have {available}")
			},
			Self::StackOverflow { limit } => write!(f, "stack overflow: limit is {limit} slots"),
			Self::OutOfFrame { kind, index, max } => {
				write!(f, "{}[{}] out of frame bounds (max {})", kind.letter(), index, max)
			},
			Self::StringIndex { index, size } => {
				write!(f, "string index out of bounds: {index} (string table size: {size})")
			},
			Self::JumpOutOfBounds { target, size } => {
				write!(f, "jump target out of bounds: {target:#x} (code size: {size})")
			},
			Self::CallTargetNotPrologue { target } => {
				write!(f, "call target {target:#x} is not a function prologue")
			},
			Self::NonZeroCaptureCount { count } => {
				write!(f, "non-closure prologue entered with {count} captures")
			},
			Self::CaptureCountMismatch { pushed, stored } => {
				write!(f, "capture count mismatch: {pushed} pushed, closure holds {stored}")
			},
			Self::BadStoreTarget { got } => {
				write!(f, "indirect store needs an array or a reference cell, got {got}")
			},
			Self::ObjectTooLarge { len } => {
				write!(f, "object length {len} exceeds the 29-bit header budget")
			},
			Self::IndexOutOfBounds { index, len } => {
				write!(f, "index {index} out of bounds for length {len}")
			},
			Self::FrameImbalance { height } => {
				write!(f, "frame teardown expected 1 value on the working stack, found {height}")
			},
			Self::EndOutsideFrame => f.write_str("frame end with no frame in progress"),
			Self::BadTagChar { ch } => write!(f, "character not allowed in a tag name: {ch:?}"),
			Self::MatchFailure { value, source, line, col } => {
				write!(f, "match failure at {source}:{line}:{col}, value {value}")
			},
			Self::EndOfCode => f.write_str("reached the end of code without a halt"),
			Self::Io(message) => write!(f, "i/o failure: {message}"),
		}
	}
}

impl From<DecodeError> for Trap {
	fn from(value: DecodeError) -> Self {
		Self::Decode(value)
	}
}

/// A [`Trap`] annotated with the bytecode position it was raised at.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
	pub offset: u32,
	pub instr: String,
	pub trap: Trap,
}

impl Display for RuntimeError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "at offset {:#06x} ({}): {}", self.offset, self.instr, self.trap)
	}
}

impl std::error::Error for RuntimeError {}
