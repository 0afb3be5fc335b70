//! Instruction-idiom frequency analysis.
//!
//! An idiom is a one- or two-instruction sequence with every 32-bit
//! immediate erased to zeros (capture kind bytes inside `CLOSURE` are
//! preserved). Only instructions reachable from the public symbols count;
//! pairs are not formed across a jump target or after a control transfer.

use std::io::Write;

use fxhash::FxHashMap;

use crate::raw::code::{Decoder, Instr};
use crate::raw::image::Bytefile;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Idiom {
	pub bytes: Vec<u8>,
	pub count: u32,
}

fn is_terminal(instr: &Instr) -> bool {
	matches!(instr, Instr::Jmp { .. } | Instr::End | Instr::Fail { .. } | Instr::Halt)
}

/// After these, the textual successor belongs to a different control
/// context, so pairing with it is meaningless.
fn splits_pairs(instr: &Instr) -> bool {
	matches!(
		instr,
		Instr::Jmp { .. }
			| Instr::Call { .. }
			| Instr::CallC { .. }
			| Instr::End
			| Instr::Fail { .. }
			| Instr::Halt,
	)
}

/// The instruction's bytes with the immediates zeroed.
fn fingerprint(code: &[u8], offset: usize, instr: &Instr) -> Vec<u8> {
	let len = instr.encoded_len();
	let mut bytes = code[offset..offset + len].to_vec();
	match instr {
		Instr::Closure { captures, .. } => {
			bytes[1..9].fill(0);
			let mut at = 9;
			for _ in 0..captures.len() {
				// the kind byte stays, the index word goes
				bytes[at + 1..at + 5].fill(0);
				at += 5;
			}
		},
		_ => bytes[1..].fill(0),
	}
	bytes
}

struct Reachability {
	reachable: Vec<bool>,
	jump_targets: Vec<bool>,
}

impl Reachability {
	fn visit(&mut self, addr: usize, queue: &mut Vec<usize>) {
		if addr < self.reachable.len() && !self.reachable[addr] {
			self.reachable[addr] = true;
			queue.push(addr);
		}
	}

	fn target(&mut self, addr: u32, queue: &mut Vec<usize>) {
		if (addr as usize) < self.jump_targets.len() {
			self.jump_targets[addr as usize] = true;
		}
		self.visit(addr as usize, queue);
	}
}

fn find_reachable(code: &[u8], entries: &[usize]) -> Reachability {
	let mut result = Reachability {
		reachable: vec![false; code.len()],
		jump_targets: vec![false; code.len()],
	};
	let mut queue: Vec<usize> = Vec::new();

	for &entry in entries {
		result.visit(entry, &mut queue);
	}

	while let Some(addr) = queue.pop() {
		let mut decoder = Decoder::at(code, addr);
		let Ok(instr) = decoder.next() else {
			continue; // undecodable bytes contribute nothing
		};

		match instr {
			Instr::Jmp { target } | Instr::CJmpZ { target } | Instr::CJmpNz { target } => {
				result.target(target, &mut queue)
			},
			Instr::Call { entry, .. } | Instr::Closure { entry, .. } => {
				result.target(entry, &mut queue)
			},
			_ => {},
		}

		if !is_terminal(&instr) {
			result.visit(decoder.pos(), &mut queue);
		}
	}

	result
}

/// Counts single and paired parameter-erased fingerprints over all
/// reachable instructions, sorted by frequency descending, then length
/// ascending, then lexicographic.
#[tracing::instrument(skip_all)]
pub fn analyze(file: &Bytefile) -> Vec<Idiom> {
	let code = file.code();
	if code.is_empty() {
		return Vec::new();
	}

	let mut entries: Vec<usize> = file.publics().iter().map(|p| p.offset as usize).collect();
	if entries.is_empty() {
		entries.push(0);
	}

	let reach = find_reachable(code, &entries);
	let mut counts: FxHashMap<Vec<u8>, u32> = FxHashMap::default();

	for offset in 0..code.len() {
		if !reach.reachable[offset] {
			continue;
		}
		let mut decoder = Decoder::at(code, offset);
		let Ok(instr) = decoder.next() else {
			continue;
		};

		let single = fingerprint(code, offset, &instr);
		*counts.entry(single.clone()).or_insert(0) += 1;

		let next = decoder.pos();
		if next < code.len() && !reach.jump_targets[next] && !splits_pairs(&instr) {
			if let Ok(successor) = Decoder::at(code, next).next() {
				let mut pair = single;
				pair.extend_from_slice(&fingerprint(code, next, &successor));
				*counts.entry(pair).or_insert(0) += 1;
			}
		}
	}

	let mut idioms: Vec<Idiom> = counts
		.into_iter()
		.map(|(bytes, count)| Idiom { bytes, count })
		.collect();
	idioms.sort_by(|a, b| {
		b.count
			.cmp(&a.count)
			.then(a.bytes.len().cmp(&b.bytes.len()))
			.then(a.bytes.cmp(&b.bytes))
	});
	tracing::debug!(idioms = idioms.len(), "idiom analysis finished");
	idioms
}

/// Writes the histogram in the tool's report format.
pub fn print(idioms: &[Idiom], out: &mut impl Write) -> std::io::Result<()> {
	writeln!(out, "=== Idiom frequency analysis ===")?;
	writeln!(out, "Total idioms found: {}", idioms.len())?;
	writeln!(out)?;
	for idiom in idioms {
		write!(out, "{:6} \u{00d7} ", idiom.count)?;
		for byte in &idiom.bytes {
			write!(out, " {byte:02X}")?;
		}
		writeln!(out)?;
	}
	Ok(())
}
