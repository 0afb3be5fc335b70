//! The static bytecode verifier.
//!
//! Two passes over the code region. The encoding pass walks linearly from
//! offset 0, checks every instruction's shape and immediates, and collects
//! the instruction-start map. The flow pass abstract-interprets from every
//! entry point, carrying one number per offset: the stack height relative
//! to the current frame, seeded at 2 for the capture-count and function
//! words every prologue consumes. All predecessors of an offset must agree
//! on its height.
//!
//! The verifier never fails fast; it accumulates diagnostics up to a cap
//! and reports them grouped by phase.

use std::fmt::{Display, Formatter};
use std::io::Write;

use fxhash::FxHashMap;

use crate::raw::code::{Decoder, Instr, VarKind};
use crate::raw::image::{Bytefile, ENTRY_SYMBOL};

/// Diagnostics kept before the report is truncated.
pub const MAX_DIAGNOSTICS: usize = 100;

/// Per-frame working-stack ceiling the flow pass enforces.
pub const STACK_CEILING: u32 = 10_000;

/// Sanity cap on argument, local and capture counts.
pub const MAX_ARITY: u32 = 255;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
	Encoding,
	Flow,
}

impl Display for Phase {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Encoding => f.write_str("encoding"),
			Self::Flow => f.write_str("control flow"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
	pub phase: Phase,
	pub offset: u32,
	pub message: String,
}

impl Display for Diagnostic {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "[{:#06x}] {}", self.offset, self.message)
	}
}

#[derive(Debug, Default)]
pub struct Report {
	pub diagnostics: Vec<Diagnostic>,
	pub truncated: bool,
	pub total_instructions: u32,
	pub max_stack_height: u32,
}

impl Report {
	pub fn ok(&self) -> bool {
		self.diagnostics.is_empty()
	}

	/// Writes the diagnostics grouped by phase.
	pub fn print(&self, out: &mut impl Write) -> std::io::Result<()> {
		for phase in [Phase::Encoding, Phase::Flow] {
			let group: Vec<_> = self.diagnostics.iter().filter(|d| d.phase == phase).collect();
			if group.is_empty() {
				continue;
			}
			writeln!(out, "{} errors ({}):", phase, group.len())?;
			for diagnostic in group {
				writeln!(out, "  {diagnostic}")?;
			}
		}
		if self.truncated {
			writeln!(out, "  (diagnostics truncated at {MAX_DIAGNOSTICS})")?;
		}
		Ok(())
	}
}

#[derive(Debug, Copy, Clone)]
struct PrologueSig {
	closure_prologue: bool,
	n_caps: u32,
	n_args: u32,
}

#[derive(Debug, Copy, Clone)]
struct CallSite {
	offset: usize,
	entry: usize,
	n_args: u32,
}

#[derive(Debug, Copy, Clone)]
struct ClosureSite {
	offset: usize,
	entry: usize,
	n_caps: u32,
}

struct Verifier<'l> {
	file: &'l Bytefile,
	code: &'l [u8],
	/// Bytes that begin an instruction, per the linear scan.
	starts: Vec<bool>,
	/// Stack height assigned to each visited offset; `None` = not reached.
	heights: Vec<Option<u32>>,
	prologues: FxHashMap<usize, PrologueSig>,
	calls: Vec<CallSite>,
	closures: Vec<ClosureSite>,
	report: Report,
}

/// Checks the image and returns the accumulated diagnostics; an empty
/// report means the image is safe to execute.
#[tracing::instrument(skip_all)]
pub fn verify(file: &Bytefile) -> Report {
	let code = file.code();
	let mut verifier = Verifier {
		file,
		code,
		starts: vec![false; code.len()],
		heights: vec![None; code.len()],
		prologues: FxHashMap::default(),
		calls: Vec::new(),
		closures: Vec::new(),
		report: Report::default(),
	};
	verifier.encoding_pass();
	verifier.link_pass();
	verifier.flow_pass();
	tracing::debug!(
		diagnostics = verifier.report.diagnostics.len(),
		instructions = verifier.report.total_instructions,
		max_height = verifier.report.max_stack_height,
		"verification finished",
	);
	verifier.report
}

impl Verifier<'_> {
	fn diag(&mut self, phase: Phase, offset: usize, message: String) {
		if self.report.diagnostics.len() >= MAX_DIAGNOSTICS {
			self.report.truncated = true;
			return;
		}
		self.report.diagnostics.push(Diagnostic { phase, offset: offset as u32, message });
	}

	fn check_string_index(&mut self, offset: usize, name: u32) {
		if name >= self.file.stringtab_size() {
			let size = self.file.stringtab_size();
			self.diag(
				Phase::Encoding,
				offset,
				format!("string index out of bounds: {name} (string table size: {size})"),
			);
		}
	}

	fn check_jump_target(&mut self, offset: usize, target: u32) {
		if target as usize >= self.code.len() {
			let size = self.code.len();
			self.diag(
				Phase::Encoding,
				offset,
				format!("jump target out of bounds: {target:#x} (code size: {size})"),
			);
		}
	}

	fn check_arity(&mut self, offset: usize, what: &str, value: u32) {
		if value > MAX_ARITY {
			self.diag(
				Phase::Encoding,
				offset,
				format!("{what} out of range: {value} (limit {MAX_ARITY})"),
			);
		}
	}

	fn check_global_index(&mut self, offset: usize, kind: VarKind, index: u32) {
		// local, argument and capture indices need the owning frame's
		// prologue; only globals are checkable in isolation
		if kind == VarKind::Global && index >= self.file.global_area_size() {
			let size = self.file.global_area_size();
			self.diag(
				Phase::Encoding,
				offset,
				format!("global index out of bounds: {index} (global area size: {size})"),
			);
		}
	}

	/// Linear scan over the whole region: shapes, immediates, the
	/// instruction-start map, and the call/closure/prologue tables.
	fn encoding_pass(&mut self) {
		let mut decoder = Decoder::new(self.code);
		while !decoder.at_end() {
			let offset = decoder.pos();
			let instr = match decoder.next() {
				Ok(instr) => instr,
				Err(err) => {
					self.diag(Phase::Encoding, offset, err.to_string());
					// resynchronise one byte further
					decoder.jump(offset + 1);
					continue;
				},
			};

			self.starts[offset] = true;
			self.report.total_instructions += 1;

			match instr {
				Instr::Str { name } => self.check_string_index(offset, name),
				Instr::Sexp { name, .. } | Instr::Tag { name, .. } => {
					self.check_string_index(offset, name)
				},
				Instr::Jmp { target } | Instr::CJmpZ { target } | Instr::CJmpNz { target } => {
					self.check_jump_target(offset, target)
				},
				Instr::Ld(var) | Instr::Lda(var) | Instr::St(var) => {
					self.check_global_index(offset, var.kind, var.index)
				},
				Instr::Begin { n_args, n_locs } => {
					self.check_arity(offset, "argument count", n_args);
					self.check_arity(offset, "local count", n_locs);
					self.prologues.insert(offset, PrologueSig {
						closure_prologue: false,
						n_caps: 0,
						n_args,
					});
				},
				Instr::CBegin { n_caps, n_args, n_locs } => {
					self.check_arity(offset, "capture count", n_caps);
					self.check_arity(offset, "argument count", n_args);
					self.check_arity(offset, "local count", n_locs);
					self.prologues.insert(offset, PrologueSig {
						closure_prologue: true,
						n_caps,
						n_args,
					});
				},
				Instr::Closure { entry, captures } => {
					self.check_jump_target(offset, entry);
					self.check_arity(offset, "capture count", captures.len() as u32);
					for var in captures.iter() {
						self.check_global_index(offset, var.kind, var.index);
					}
					self.closures.push(ClosureSite {
						offset,
						entry: entry as usize,
						n_caps: captures.len() as u32,
					});
				},
				Instr::Call { entry, n_args } => {
					self.check_jump_target(offset, entry);
					self.check_arity(offset, "argument count", n_args);
					self.calls.push(CallSite { offset, entry: entry as usize, n_args });
				},
				Instr::CallC { n_args } => self.check_arity(offset, "argument count", n_args),
				_ => {},
			}
		}
	}

	/// Consistency between call sites, closure constructors and the
	/// prologues they target.
	fn link_pass(&mut self) {
		for site in self.calls.clone() {
			if site.entry >= self.code.len() {
				continue; // already diagnosed
			}
			if !self.starts[site.entry] {
				self.diag(
					Phase::Flow,
					site.offset,
					format!("call target {:#x} is inside an instruction", site.entry),
				);
				continue;
			}
			match self.prologues.get(&site.entry).copied() {
				None => self.diag(
					Phase::Flow,
					site.offset,
					format!("call target {:#x} is not a function prologue", site.entry),
				),
				Some(sig) if sig.n_args != site.n_args => self.diag(
					Phase::Flow,
					site.offset,
					format!(
						"call arity mismatch: {} arguments passed, target declares {}",
						site.n_args, sig.n_args,
					),
				),
				Some(_) => {},
			}
		}

		for site in self.closures.clone() {
			if site.entry >= self.code.len() {
				continue;
			}
			if !self.starts[site.entry] {
				self.diag(
					Phase::Flow,
					site.offset,
					format!("closure entry {:#x} is inside an instruction", site.entry),
				);
				continue;
			}
			match self.prologues.get(&site.entry).copied() {
				None => self.diag(
					Phase::Flow,
					site.offset,
					format!("closure entry {:#x} is not a function prologue", site.entry),
				),
				Some(sig) if site.n_caps > 0 && !sig.closure_prologue => self.diag(
					Phase::Flow,
					site.offset,
					format!(
						"closure with {} captures targets a plain function prologue",
						site.n_caps,
					),
				),
				Some(sig) if sig.closure_prologue && sig.n_caps != site.n_caps => self.diag(
					Phase::Flow,
					site.offset,
					format!(
						"closure capture count mismatch: {} captured, target declares {}",
						site.n_caps, sig.n_caps,
					),
				),
				Some(_) => {},
			}
		}
	}

	fn propagate(
		&mut self,
		worklist: &mut Vec<usize>,
		from: usize,
		to: usize,
		height: u32,
	) {
		if to >= self.code.len() {
			return; // out-of-range targets were diagnosed in the encoding pass
		}
		if !self.starts[to] {
			self.diag(
				Phase::Flow,
				from,
				format!("jump into the middle of an instruction at {to:#x}"),
			);
			return;
		}
		match self.heights[to] {
			None => {
				self.heights[to] = Some(height);
				worklist.push(to);
			},
			Some(existing) if existing != height => self.diag(
				Phase::Flow,
				from,
				format!("stack height mismatch at merge point {to:#x}: {existing} vs {height}"),
			),
			Some(_) => {},
		}
	}

	fn seed(&mut self, worklist: &mut Vec<usize>, offset: usize) {
		if offset >= self.code.len() || !self.starts[offset] {
			return;
		}
		// every entry point starts with the capture-count and function
		// words already on the frame base
		match self.heights[offset] {
			None => {
				self.heights[offset] = Some(2);
				worklist.push(offset);
			},
			Some(2) => {},
			Some(existing) => self.diag(
				Phase::Flow,
				offset,
				format!("stack height mismatch at merge point {offset:#x}: {existing} vs 2"),
			),
		}
	}

	/// Worklist interpretation of stack heights across control flow.
	fn flow_pass(&mut self) {
		if self.file.find_public(ENTRY_SYMBOL).is_none() {
			self.diag(Phase::Flow, 0, format!("required public symbol {ENTRY_SYMBOL:?} not found"));
		}

		let mut worklist = Vec::new();
		for public in self.file.publics().to_vec() {
			let offset = public.offset as usize;
			if offset < self.code.len() && !self.starts[offset] {
				self.diag(
					Phase::Flow,
					offset,
					"public symbol points inside an instruction".to_string(),
				);
				continue;
			}
			self.seed(&mut worklist, offset);
		}
		// a prologue only runs when something transfers to it; seeding every
		// call target and closure entry keeps private functions covered
		for site in self.calls.clone() {
			self.seed(&mut worklist, site.entry);
		}
		for site in self.closures.clone() {
			self.seed(&mut worklist, site.entry);
		}

		while let Some(offset) = worklist.pop() {
			let Ok(instr) = Decoder::at(self.code, offset).next() else {
				continue; // the encoding pass already reported it
			};
			let height = self.heights[offset].expect("enqueued offsets carry a height");
			let delta = instr.stack_delta();

			if height < delta.pops {
				self.diag(
					Phase::Flow,
					offset,
					format!("stack underflow: {} needs {} values, have {}", instr.mnemonic(), delta.pops, height),
				);
				continue;
			}
			let next_height = height - delta.pops + delta.pushes;
			if next_height > STACK_CEILING {
				self.diag(
					Phase::Flow,
					offset,
					format!("stack overflow: height {next_height} exceeds the ceiling of {STACK_CEILING}"),
				);
				continue;
			}
			self.report.max_stack_height = self.report.max_stack_height.max(next_height);

			let fall = offset + instr.encoded_len();
			match instr {
				Instr::Jmp { target } => {
					self.propagate(&mut worklist, offset, target as usize, next_height);
				},
				Instr::CJmpZ { target } | Instr::CJmpNz { target } => {
					self.propagate(&mut worklist, offset, target as usize, next_height);
					self.fall_through(&mut worklist, offset, fall, next_height);
				},
				Instr::End | Instr::Fail { .. } | Instr::Halt => {},
				_ => self.fall_through(&mut worklist, offset, fall, next_height),
			}
		}

		let unreachable: Vec<usize> = (0..self.code.len())
			.filter(|&o| self.starts[o] && self.heights[o].is_none())
			.collect();
		for offset in unreachable {
			self.diag(Phase::Flow, offset, "unreachable code".to_string());
		}
	}

	fn fall_through(&mut self, worklist: &mut Vec<usize>, offset: usize, fall: usize, height: u32) {
		if fall >= self.code.len() {
			self.diag(
				Phase::Flow,
				offset,
				"control may run off the end of the code region".to_string(),
			);
			return;
		}
		self.propagate(worklist, offset, fall, height);
	}
}
