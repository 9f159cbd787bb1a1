// src/system/binary.rs

//! # Binary Collaborator Contract
//!
//! The engine never parses executables itself. A [`BinaryParser`] turns a file
//! into a [`BinaryObject`], the pipeline mutates it through a [`BinaryHandle`]
//! and asks it to build itself once at the end of a run.
//!
//! [`MemoryParser`] and [`MemoryBinary`] implement the contract without touching
//! the file contents. They back dry runs and the test-suite.

use std::{
    cell::RefCell,
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
};
use thiserror::Error;

/// Shared, single-threaded handle on the binary being altered by one run.
pub type BinaryHandle = Rc<RefCell<Box<dyn BinaryObject>>>;

/// Wraps a freshly parsed object into a handle.
pub fn into_handle(object: Box<dyn BinaryObject>) -> BinaryHandle {
    Rc::new(RefCell::new(object))
}

/// Errors reported by a binary parser or object.
#[derive(Error, Debug)]
pub enum BinaryError {
    /// The executable could not be read.
    #[error("Could not read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The executable is not a valid binary of the expected format.
    #[error("Could not parse '{path}': {reason}")]
    Parse { path: PathBuf, reason: String },
    /// The binary does not implement this mutation.
    #[error("Operation '{operation}' is not supported for {format} binaries.")]
    Unsupported { operation: &'static str, format: String },
    /// No section has this name.
    #[error("Section '{0}' does not exist.")]
    SectionNotFound(String),
    /// A section with this name already exists.
    #[error("Section '{0}' already exists.")]
    DuplicateSection(String),
    /// The binary could not be written back.
    #[error("Could not build '{path}': {reason}")]
    Build { path: PathBuf, reason: String },
}

/// A section as seen by expressions (`sections` binding, `exe.sections`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Section {
    /// Section name (e.g. `.text`).
    pub name: String,
    /// Offset of the raw data in the file.
    pub offset: u64,
    /// Size of the raw data.
    pub size: u64,
    /// Size once mapped in memory.
    pub virtual_size: u64,
    /// Format-specific flags.
    pub characteristics: u32,
    /// Raw data.
    pub content: Vec<u8>,
}

impl Section {
    /// A section holding `content`, not yet laid out.
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        let size = content.len() as u64;
        Self {
            name: name.into(),
            offset: 0,
            size,
            virtual_size: size,
            characteristics: 0,
            content,
        }
    }

    /// Sets the section flags.
    pub fn with_characteristics(mut self, characteristics: u32) -> Self {
        self.characteristics = characteristics;
        self
    }

    /// Shannon entropy of the raw content, in bits per byte.
    pub fn entropy(&self) -> f64 {
        if self.content.is_empty() {
            return 0.0;
        }
        let mut counts = [0usize; 256];
        for byte in &self.content {
            if let Some(slot) = counts.get_mut(usize::from(*byte)) {
                *slot += 1;
            }
        }
        let total = self.content.len() as f64;
        counts
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f64 / total;
                -p * p.log2()
            })
            .sum()
    }
}

/// An externally parsed executable.
///
/// Mutation primitives are optional: a parser that cannot perform one keeps
/// the default implementation, which reports [`BinaryError::Unsupported`].
pub trait BinaryObject: fmt::Debug {
    /// Leaf executable format (`PE32`, `ELF64`, ...).
    fn format(&self) -> &str;

    fn path(&self) -> &Path;

    fn sections(&self) -> Vec<Section>;

    fn compute_checksum(&self) -> u32;

    /// Writes the altered binary back. Called once per pipeline run.
    fn build(&mut self) -> Result<(), BinaryError>;

    fn add_section(&mut self, _name: &str, _data: &[u8]) -> Result<(), BinaryError> {
        Err(self.unsupported("add_section"))
    }

    fn rename_section(&mut self, _old: &str, _new: &str) -> Result<(), BinaryError> {
        Err(self.unsupported("rename_section"))
    }

    fn append_to_section(&mut self, _name: &str, _data: &[u8]) -> Result<(), BinaryError> {
        Err(self.unsupported("append_to_section"))
    }

    fn set_checksum(&mut self, _value: u32) -> Result<(), BinaryError> {
        Err(self.unsupported("set_checksum"))
    }

    fn unsupported(&self, operation: &'static str) -> BinaryError {
        BinaryError::Unsupported {
            operation,
            format: self.format().to_string(),
        }
    }
}

/// Turns a file into a [`BinaryObject`].
pub trait BinaryParser {
    fn parse(&self, path: &Path, format: &str) -> Result<Box<dyn BinaryObject>, BinaryError>;
}

// --- IN-MEMORY IMPLEMENTATION ---

/// A binary whose structure only lives in memory. `build` records the commit
/// without writing anything.
#[derive(Debug, Clone, Default)]
pub struct MemoryBinary {
    format: String,
    path: PathBuf,
    sections: Vec<Section>,
    checksum: Option<u32>,
    builds: usize,
}

impl MemoryBinary {
    /// An in-memory binary with the given sections, laid out back to back.
    pub fn new(format: impl Into<String>, path: impl Into<PathBuf>, sections: Vec<Section>) -> Self {
        let mut binary = Self {
            format: format.into(),
            path: path.into(),
            sections,
            checksum: None,
            builds: 0,
        };
        binary.layout();
        binary
    }

    /// Number of times [`BinaryObject::build`] ran on this object.
    pub fn build_count(&self) -> usize {
        self.builds
    }

    fn section_mut(&mut self, name: &str) -> Result<&mut Section, BinaryError> {
        self.sections
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| BinaryError::SectionNotFound(name.to_string()))
    }

    // Sections are laid out contiguously in declaration order.
    fn layout(&mut self) {
        let mut offset = 0u64;
        for section in &mut self.sections {
            section.offset = offset;
            section.size = section.content.len() as u64;
            section.virtual_size = section.virtual_size.max(section.size);
            offset += section.size;
        }
    }
}

impl BinaryObject for MemoryBinary {
    fn format(&self) -> &str {
        &self.format
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn sections(&self) -> Vec<Section> {
        self.sections.clone()
    }

    /// PE-style checksum: 16-bit one's complement sum of the image plus its length.
    fn compute_checksum(&self) -> u32 {
        if let Some(value) = self.checksum {
            return value;
        }
        let mut sum: u64 = 0;
        let mut length: u64 = 0;
        for section in &self.sections {
            for pair in section.content.chunks(2) {
                let word = match pair {
                    [lo, hi] => u64::from(*lo) | (u64::from(*hi) << 8),
                    [lo] => u64::from(*lo),
                    _ => 0,
                };
                sum += word;
                sum = (sum & 0xffff) + (sum >> 16);
            }
            length += section.content.len() as u64;
        }
        sum = (sum & 0xffff) + (sum >> 16);
        u32::try_from((sum + length) & 0xffff_ffff).unwrap_or(u32::MAX)
    }

    fn build(&mut self) -> Result<(), BinaryError> {
        self.layout();
        self.builds += 1;
        log::debug!("Built '{}' ({} sections)", self.path.display(), self.sections.len());
        Ok(())
    }

    fn add_section(&mut self, name: &str, data: &[u8]) -> Result<(), BinaryError> {
        if self.sections.iter().any(|s| s.name == name) {
            return Err(BinaryError::DuplicateSection(name.to_string()));
        }
        self.sections.push(Section::new(name, data.to_vec()));
        self.layout();
        Ok(())
    }

    fn rename_section(&mut self, old: &str, new: &str) -> Result<(), BinaryError> {
        self.section_mut(old)?.name = new.to_string();
        Ok(())
    }

    fn append_to_section(&mut self, name: &str, data: &[u8]) -> Result<(), BinaryError> {
        self.section_mut(name)?.content.extend_from_slice(data);
        self.layout();
        Ok(())
    }

    fn set_checksum(&mut self, value: u32) -> Result<(), BinaryError> {
        if !self.format.starts_with("PE") && self.format != ".NET" {
            return Err(self.unsupported("set_checksum"));
        }
        self.checksum = Some(value);
        Ok(())
    }
}

/// Produces [`MemoryBinary`] objects sharing a prototype section layout.
#[derive(Debug, Clone)]
pub struct MemoryParser {
    sections: Vec<Section>,
}

impl MemoryParser {
    /// A parser handing out copies of `sections`.
    pub fn new(sections: Vec<Section>) -> Self {
        Self { sections }
    }
}

impl Default for MemoryParser {
    /// A minimal three-section layout.
    fn default() -> Self {
        Self::new(vec![
            Section::new(".text", vec![0x90; 64]).with_characteristics(0x6000_0020),
            Section::new(".data", vec![0x00; 32]).with_characteristics(0xC000_0040),
            Section::new(".rsrc", vec![0x01; 16]).with_characteristics(0x4000_0040),
        ])
    }
}

impl BinaryParser for MemoryParser {
    fn parse(&self, path: &Path, format: &str) -> Result<Box<dyn BinaryObject>, BinaryError> {
        log::debug!("Parsing '{}' as {} (in memory)", path.display(), format);
        Ok(Box::new(MemoryBinary::new(format, path, self.sections.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(format: &str) -> MemoryBinary {
        MemoryBinary::new(
            format,
            "/tmp/sample.exe",
            vec![Section::new(".text", vec![1, 2, 3]), Section::new(".data", vec![4; 5])],
        )
    }

    #[test]
    fn test_sections_are_laid_out_contiguously() {
        let bin = binary("PE32");
        let sections = bin.sections();
        assert_eq!(sections[0].offset, 0);
        assert_eq!(sections[1].offset, 3);
        assert_eq!(sections[1].size, 5);
    }

    #[test]
    fn test_add_rename_and_append() {
        let mut bin = binary("ELF64");
        bin.add_section(".extra", b"abc").unwrap();
        assert!(matches!(
            bin.add_section(".extra", b""),
            Err(BinaryError::DuplicateSection(_))
        ));
        bin.rename_section(".extra", ".new").unwrap();
        bin.append_to_section(".new", b"de").unwrap();
        let last = bin.sections().pop().unwrap();
        assert_eq!(last.name, ".new");
        assert_eq!(last.content, b"abcde".to_vec());
        assert_eq!(last.offset, 8);
        assert!(matches!(
            bin.rename_section(".missing", ".x"),
            Err(BinaryError::SectionNotFound(_))
        ));
    }

    #[test]
    fn test_checksum_is_only_settable_on_pe() {
        let mut pe = binary("PE32");
        pe.set_checksum(0x1234).unwrap();
        assert_eq!(pe.compute_checksum(), 0x1234);

        let mut elf = binary("ELF32");
        assert!(matches!(
            elf.set_checksum(1),
            Err(BinaryError::Unsupported { operation: "set_checksum", .. })
        ));
    }

    #[test]
    fn test_entropy_bounds() {
        assert_eq!(Section::new("a", vec![7; 100]).entropy(), 0.0);
        let all: Vec<u8> = (0..=255).collect();
        assert!((Section::new("b", all).entropy() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_build_is_counted() {
        let mut bin = binary("PE64");
        assert_eq!(bin.build_count(), 0);
        bin.build().unwrap();
        assert_eq!(bin.build_count(), 1);
    }
}
