use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use lamium::runtime::Runtime;
use lamium::{idioms, verify, vm, Bytefile};

const EXIT_VERIFICATION_FAILED: u8 = 1;
const EXIT_TRAP: u8 = 255;

fn usage(program: &str) -> ExitCode {
	eprintln!(
		"Usage:\n  \
		 {program} program.bc           - execute bytecode\n  \
		 {program} --verify program.bc  - verify bytecode\n  \
		 {program} --idioms program.bc  - analyze instruction idioms",
	);
	ExitCode::from(EXIT_TRAP)
}

fn load(path: &str) -> Result<Bytefile, ExitCode> {
	Bytefile::load_file(path).map_err(|err| {
		eprintln!("*** FAILURE: {err}");
		ExitCode::from(EXIT_TRAP)
	})
}

fn verify_mode(path: &str) -> ExitCode {
	let file = match load(path) {
		Ok(file) => file,
		Err(code) => return code,
	};
	let report = verify::verify(&file);
	if report.ok() {
		println!("verification passed");
		println!("  total instructions: {}", report.total_instructions);
		println!("  maximum stack height: {}", report.max_stack_height);
		return ExitCode::SUCCESS;
	}
	let _ = report.print(&mut std::io::stderr());
	ExitCode::from(EXIT_VERIFICATION_FAILED)
}

fn idioms_mode(path: &str) -> ExitCode {
	let file = match load(path) {
		Ok(file) => file,
		Err(code) => return code,
	};
	let idioms = idioms::analyze(&file);
	match idioms::print(&idioms, &mut std::io::stdout()) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			eprintln!("*** FAILURE: {err}");
			ExitCode::from(EXIT_TRAP)
		},
	}
}

fn run_mode(path: &str) -> ExitCode {
	let file = match load(path) {
		Ok(file) => file,
		Err(code) => return code,
	};
	let entry = match file.entry_offset() {
		Ok(entry) => entry,
		Err(err) => {
			eprintln!("*** FAILURE: {err}");
			return ExitCode::from(EXIT_TRAP);
		},
	};
	match vm::run(&file, entry, Runtime::default(), path) {
		Ok(_) => ExitCode::SUCCESS,
		Err(err) => {
			eprintln!("*** FAILURE: {err}");
			ExitCode::from(EXIT_TRAP)
		},
	}
}

fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_writer(std::io::stderr)
		.init();

	let args: Vec<String> = std::env::args().collect();
	let program = args.first().map(String::as_str).unwrap_or("lamium");

	match (args.get(1).map(String::as_str), args.get(2).map(String::as_str)) {
		(Some("--verify"), Some(path)) => verify_mode(path),
		(Some("--idioms"), Some(path)) => idioms_mode(path),
		(Some(path), None) if !path.starts_with("--") => run_mode(path),
		_ => usage(program),
	}
}
