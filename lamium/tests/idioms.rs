//! Idiom histogram tests.

mod common;

use common::Asm;
use lamium::idioms::{self, Idiom};
use lamium::raw::code::VarKind;

fn find<'a>(idioms: &'a [Idiom], bytes: &[u8]) -> Option<&'a Idiom> {
	idioms.iter().find(|i| i.bytes == bytes)
}

const LD_L: [u8; 5] = [0x21, 0, 0, 0, 0];
const BINOP_ADD: [u8; 1] = [0x01];
const CONST: [u8; 5] = [0x10, 0, 0, 0, 0];

#[test]
fn counts_parameter_erased_pairs() {
	let mut asm = Asm::new();
	asm.public("main", 0);
	asm.begin(0, 1);
	asm.const_(0);
	for _ in 0..3 {
		asm.ld(VarKind::Local, 0).binop("+");
	}
	asm.end();

	let idioms = idioms::analyze(&asm.file());

	// the (LD L, BINOP +) pair appears once per addition, with the local
	// index erased
	let pair: Vec<u8> = [&LD_L[..], &BINOP_ADD[..]].concat();
	assert_eq!(find(&idioms, &pair).map(|i| i.count), Some(3));
	assert_eq!(find(&idioms, &LD_L).map(|i| i.count), Some(3));
	assert_eq!(find(&idioms, &BINOP_ADD).map(|i| i.count), Some(3));
	assert_eq!(find(&idioms, &CONST).map(|i| i.count), Some(1));
}

#[test]
fn orders_by_count_then_length_then_bytes() {
	let mut asm = Asm::new();
	asm.public("main", 0);
	asm.begin(0, 1);
	asm.const_(0);
	for _ in 0..3 {
		asm.ld(VarKind::Local, 0).binop("+");
	}
	asm.end();

	let idioms = idioms::analyze(&asm.file());

	for window in idioms.windows(2) {
		let (a, b) = (&window[0], &window[1]);
		let ordered = a.count > b.count
			|| (a.count == b.count && a.bytes.len() < b.bytes.len())
			|| (a.count == b.count && a.bytes.len() == b.bytes.len() && a.bytes <= b.bytes);
		assert!(ordered, "{a:?} must precede {b:?}");
	}

	// the three count-3 idioms arrive shortest first
	assert_eq!(idioms[0].bytes, BINOP_ADD.to_vec());
	assert_eq!(idioms[1].bytes, LD_L.to_vec());
}

#[test]
fn pairs_do_not_cross_jump_targets() {
	let mut asm = Asm::new();
	asm.public("main", 0);
	asm.begin(0, 0);
	asm.const_(1);
	let to_join = asm.cjmp_z(0);
	asm.const_(7);
	let join = asm.here();
	asm.patch(to_join, join);
	asm.drop_().const_(0).end();

	let idioms = idioms::analyze(&asm.file());

	// (CONST, DROP) straddles the join point, so only the pair formed
	// before the jump target survives
	let crossing: Vec<u8> = [&CONST[..], &[0x18][..]].concat();
	assert!(find(&idioms, &crossing).is_none(), "pair must not cross a jump target");
	assert_eq!(find(&idioms, &CONST).map(|i| i.count), Some(3));
}

#[test]
fn called_functions_are_reachable() {
	let mut asm = Asm::new();

	let f = asm.here();
	asm.begin(1, 0).ld(VarKind::Arg, 0).end();

	let main = asm.here();
	asm.public("main", main);
	asm.begin(0, 0);
	asm.const_(5);
	asm.call(f, 1);
	asm.end();

	let idioms = idioms::analyze(&asm.file());

	let begin: Vec<u8> = vec![0x52, 0, 0, 0, 0, 0, 0, 0, 0];
	assert_eq!(find(&idioms, &begin).map(|i| i.count), Some(2), "both prologues reachable");

	// nothing pairs across a CALL
	let call_then_end: Vec<u8> = vec![0x56, 0, 0, 0, 0, 0, 0, 0, 0, 0x16];
	assert!(find(&idioms, &call_then_end).is_none());
}

#[test]
fn unreferenced_code_contributes_nothing() {
	let mut asm = Asm::new();

	let main = asm.here();
	asm.public("main", main);
	asm.begin(0, 0).const_(0).end();
	// a whole function nobody calls
	asm.begin(2, 2).swap().end();

	let idioms = idioms::analyze(&asm.file());
	assert!(find(&idioms, &[0x1a]).is_none(), "SWAP is in dead code");
	let begin: Vec<u8> = vec![0x52, 0, 0, 0, 0, 0, 0, 0, 0];
	assert_eq!(find(&idioms, &begin).map(|i| i.count), Some(1));
}

#[test]
fn closure_fingerprints_keep_capture_kinds() {
	let mut asm = Asm::new();
	asm.globals(2);

	let f = asm.here();
	asm.cbegin(2, 0, 0).const_(0).end();

	let main = asm.here();
	asm.public("main", main);
	asm.begin(0, 0);
	asm.closure(f, &[(VarKind::Global, 0), (VarKind::Global, 1)]);
	asm.end();

	let idioms = idioms::analyze(&asm.file());
	let mut expected = vec![0x54];
	expected.extend_from_slice(&[0; 8]);
	expected.push(VarKind::Global as u8);
	expected.extend_from_slice(&[0; 4]);
	expected.push(VarKind::Global as u8);
	expected.extend_from_slice(&[0; 4]);
	assert_eq!(find(&idioms, &expected).map(|i| i.count), Some(1));
}
