//! The persisted bytecode image.
//!
//! Layout (little-endian throughout):
//!
//! ```text
//!  0: u32 stringtab_size          byte length of the string table
//!  4: u32 global_area_size        number of global slots
//!  8: u32 public_symbols_number   N
//! 12: (u32 name, u32 offset) × N  publics table
//!   : u8[stringtab_size]          NUL-terminated strings
//!   : u8[..]                      code region, to end of file
//! ```

use std::fmt::{Debug, Formatter};
use std::io::Cursor;
use std::path::Path;

use fxhash::FxHashMap;

use crate::utilities::{read_bytes_slice_from_stream, FromByteStream};

pub const ENTRY_SYMBOL: &str = "main";

#[derive(Debug)]
pub enum LoadError {
	Io(std::io::Error),
	/// A public symbol's name offset does not resolve to a NUL-terminated
	/// UTF-8 string inside the string table.
	PublicName { index: usize, name: u32 },
	/// A public symbol's code offset lies outside the code region.
	PublicOffset { name: String, offset: u32 },
	MissingEntrySymbol,
}

impl From<std::io::Error> for LoadError {
	fn from(value: std::io::Error) -> Self {
		Self::Io(value)
	}
}

impl std::fmt::Display for LoadError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Io(err) => write!(f, "malformed bytecode image: {err}"),
			Self::PublicName { index, name } => {
				write!(f, "public symbol {index} has an invalid name offset {name}")
			},
			Self::PublicOffset { name, offset } => {
				write!(f, "public symbol {name:?} points outside the code region: {offset:#x}")
			},
			Self::MissingEntrySymbol => {
				write!(f, "required public symbol {ENTRY_SYMBOL:?} not found")
			},
		}
	}
}

impl std::error::Error for LoadError {}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PublicEntry {
	pub name: u32,
	pub offset: u32,
}

impl FromByteStream for PublicEntry {
	type Deps = ();
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		Ok(Self {
			name: u32::read(stream, &())?,
			offset: u32::read(stream, &())?,
		})
	}
}

impl Debug for PublicEntry {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "PublicEntry {{ name: {}, offset: {:#x} }}", self.name, self.offset)
	}
}

/// A loaded bytecode file, immutable once constructed.
pub struct Bytefile {
	stringtab: Vec<u8>,
	publics: Vec<PublicEntry>,
	global_area_size: u32,
	code: Vec<u8>,
	entry_points: FxHashMap<String, u32>,
}

impl Bytefile {
	pub fn load_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
		let bytes = std::fs::read(path)?;
		Self::load(&bytes)
	}

	#[tracing::instrument(skip_all)]
	pub fn load(bytes: &[u8]) -> Result<Self, LoadError> {
		let mut stream = Cursor::new(bytes);
		let stringtab_size = u32::read(&mut stream, &())?;
		let global_area_size = u32::read(&mut stream, &())?;
		let public_symbols_number = u32::read(&mut stream, &())?;

		let mut publics = Vec::with_capacity(public_symbols_number as usize);
		for _ in 0..public_symbols_number {
			publics.push(PublicEntry::read(&mut stream, &())?);
		}

		let stringtab = read_bytes_slice_from_stream(&mut stream, stringtab_size as usize)?.to_vec();
		let code = bytes[stream.position() as usize..].to_vec();

		let mut file = Self {
			stringtab,
			publics,
			global_area_size,
			code,
			entry_points: FxHashMap::default(),
		};

		let mut entry_points = FxHashMap::default();
		for (index, public) in file.publics.iter().enumerate() {
			let Some(name) = file.string(public.name) else {
				return Err(LoadError::PublicName { index, name: public.name });
			};
			if public.offset as usize >= file.code.len() {
				return Err(LoadError::PublicOffset { name: name.to_string(), offset: public.offset });
			}
			entry_points.insert(name.to_string(), public.offset);
		}
		file.entry_points = entry_points;

		tracing::debug!(
			strings = file.stringtab.len(),
			globals = file.global_area_size,
			publics = file.publics.len(),
			code = file.code.len(),
			"loaded bytecode image",
		);
		Ok(file)
	}

	/// Looks up a NUL-terminated string by its byte offset in the string table.
	pub fn string(&self, offset: u32) -> Option<&str> {
		let slice = self.stringtab.get(offset as usize..)?;
		let end = slice.iter().position(|c| *c == 0)?;
		std::str::from_utf8(&slice[..end]).ok()
	}

	pub fn stringtab_size(&self) -> u32 {
		self.stringtab.len() as u32
	}

	pub fn global_area_size(&self) -> u32 {
		self.global_area_size
	}

	pub fn publics(&self) -> &[PublicEntry] {
		&self.publics
	}

	pub fn code(&self) -> &[u8] {
		&self.code
	}

	pub fn find_public(&self, name: &str) -> Option<u32> {
		self.entry_points.get(name).copied()
	}

	/// The code offset of the program entry point.
	pub fn entry_offset(&self) -> Result<u32, LoadError> {
		self.find_public(ENTRY_SYMBOL).ok_or(LoadError::MissingEntrySymbol)
	}
}

impl Debug for Bytefile {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("Bytefile");
		dbg.field("stringtab", &format_args!("[u8; {}]", self.stringtab.len()));
		dbg.field("publics", &self.publics);
		dbg.field("global_area_size", &self.global_area_size);
		dbg.field("code", &format_args!("[u8; {}]", self.code.len()));
		dbg.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn image(strings: &[&str], publics: &[(u32, u32)], globals: u32, code: &[u8]) -> Vec<u8> {
		let mut stringtab = Vec::new();
		for s in strings {
			stringtab.extend_from_slice(s.as_bytes());
			stringtab.push(0);
		}
		let mut bytes = Vec::new();
		bytes.extend_from_slice(&(stringtab.len() as u32).to_le_bytes());
		bytes.extend_from_slice(&globals.to_le_bytes());
		bytes.extend_from_slice(&(publics.len() as u32).to_le_bytes());
		for (name, offset) in publics {
			bytes.extend_from_slice(&name.to_le_bytes());
			bytes.extend_from_slice(&offset.to_le_bytes());
		}
		bytes.extend_from_slice(&stringtab);
		bytes.extend_from_slice(code);
		bytes
	}

	#[test]
	fn loads_a_minimal_image() {
		let bytes = image(&["main"], &[(0, 0)], 2, &[0x52, 0, 0, 0, 0, 0, 0, 0, 0]);
		let file = Bytefile::load(&bytes).unwrap();
		assert_eq!(file.global_area_size(), 2);
		assert_eq!(file.string(0), Some("main"));
		assert_eq!(file.entry_offset().unwrap(), 0);
	}

	#[test]
	fn rejects_truncated_header() {
		let err = Bytefile::load(&[1, 0, 0]).unwrap_err();
		assert!(matches!(err, LoadError::Io(_)));
	}

	#[test]
	fn rejects_string_table_past_end_of_file() {
		let mut bytes = Vec::new();
		bytes.extend_from_slice(&100u32.to_le_bytes());
		bytes.extend_from_slice(&0u32.to_le_bytes());
		bytes.extend_from_slice(&0u32.to_le_bytes());
		bytes.extend_from_slice(&[0; 10]);
		let err = Bytefile::load(&bytes).unwrap_err();
		assert!(matches!(err, LoadError::Io(_)));
	}

	#[test]
	fn rejects_public_name_outside_string_table() {
		let bytes = image(&["main"], &[(40, 0)], 0, &[0xF0]);
		let err = Bytefile::load(&bytes).unwrap_err();
		assert!(matches!(err, LoadError::PublicName { index: 0, name: 40 }));
	}

	#[test]
	fn rejects_public_offset_outside_code() {
		let bytes = image(&["main"], &[(0, 9)], 0, &[0xF0]);
		let err = Bytefile::load(&bytes).unwrap_err();
		assert!(matches!(err, LoadError::PublicOffset { offset: 9, .. }));
	}

	#[test]
	fn missing_entry_symbol_is_reported_on_lookup() {
		let bytes = image(&["init"], &[(0, 0)], 0, &[0xF0]);
		let file = Bytefile::load(&bytes).unwrap();
		assert!(matches!(file.entry_offset(), Err(LoadError::MissingEntrySymbol)));
	}

	#[test]
	fn string_lookup_is_offset_based() {
		let bytes = image(&["main", "fib"], &[(0, 0)], 0, &[0xF0]);
		let file = Bytefile::load(&bytes).unwrap();
		assert_eq!(file.string(0), Some("main"));
		assert_eq!(file.string(2), Some("in"));
		assert_eq!(file.string(5), Some("fib"));
		assert_eq!(file.string(9), None);
	}
}
