//! Binary Loader Module
//!
//! Parses ELF executables and shared objects using goblin and extracts:
//! - Entry point and PIE-ness
//! - Function symbols from `.symtab` and `.dynsym`
//!
//! Link-time addresses are turned into run-time ones with the load bias
//! read from `/proc/<pid>/maps`.

use anyhow::{anyhow, Context, Result};
use goblin::elf::{header, section_header, sym, Elf};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::symbol::{Library, LibrarySymbol};

/// A function symbol as found in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    /// Link-time address
    pub address: u64,
}

/// Parsed ELF file
#[derive(Debug)]
pub struct LoadedBinary {
    pub path: PathBuf,
    /// Link-time entry point
    pub entry_point: u64,
    /// Position independent (`ET_DYN`), needs a load bias
    pub is_pie: bool,
    pub functions: Vec<FunctionInfo>,
}

impl LoadedBinary {
    /// Load and parse an ELF file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
        Self::from_bytes(&data, path)
    }

    /// Parse ELF from bytes. `path` is only recorded.
    pub fn from_bytes<P: AsRef<Path>>(data: &[u8], path: P) -> Result<Self> {
        if data.len() < 4 || data[0..4] != [0x7F, b'E', b'L', b'F'] {
            return Err(anyhow!("{} is not an ELF file", path.as_ref().display()));
        }
        let elf = Elf::parse(data)?;

        let mut functions = Vec::new();
        collect_functions(&mut functions, &elf.syms, &elf.strtab);
        collect_functions(&mut functions, &elf.dynsyms, &elf.dynstrtab);

        log::debug!(
            "{}: {} function symbols, entry {:#x}",
            path.as_ref().display(),
            functions.len(),
            elf.entry
        );

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            entry_point: elf.entry,
            is_pie: elf.header.e_type == header::ET_DYN,
            functions,
        })
    }

    /// Build the library descriptor and its symbols at run-time addresses.
    ///
    /// The caller keeps the returned `Arc`s alive for as long as breakpoints
    /// should be able to name their symbol.
    pub fn symbols(&self, bias: u64) -> (Arc<Library>, Vec<Arc<LibrarySymbol>>) {
        let soname = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned());
        let library = Arc::new(Library::new(soname, self.path.clone(), bias));
        let symbols = self
            .functions
            .iter()
            .map(|f| {
                Arc::new(LibrarySymbol::new(
                    f.name.clone(),
                    f.address.wrapping_add(bias),
                    library.clone(),
                ))
            })
            .collect();
        (library, symbols)
    }
}

fn collect_functions(out: &mut Vec<FunctionInfo>, syms: &sym::Symtab<'_>, strtab: &goblin::strtab::Strtab<'_>) {
    for s in syms.iter() {
        if s.st_type() != sym::STT_FUNC
            || s.st_value == 0
            || s.st_shndx == section_header::SHN_UNDEF as usize
        {
            continue;
        }
        let Some(name) = strtab.get_at(s.st_name).filter(|n| !n.is_empty()) else {
            continue;
        };
        if out.iter().any(|f| f.address == s.st_value && f.name == name) {
            continue;
        }
        out.push(FunctionInfo {
            name: name.to_string(),
            address: s.st_value,
        });
    }
}

/// Load bias of the object mapped from `path` in process `pid`
pub fn load_bias(pid: i32, path: &Path) -> Result<u64> {
    let maps_path = format!("/proc/{}/maps", pid);
    let maps = fs::read_to_string(&maps_path).with_context(|| format!("cannot read {}", maps_path))?;
    bias_from_maps(&maps, path).ok_or_else(|| anyhow!("{} is not mapped in process {}", path.display(), pid))
}

/// Scan a maps listing for the first mapping of `path`. The bias is the
/// mapping start minus its file offset.
fn bias_from_maps(maps: &str, path: &Path) -> Option<u64> {
    maps.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let _perms = fields.next()?;
        let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
        let _dev = fields.next()?;
        let _inode = fields.next()?;
        let file = fields.next()?;
        if Path::new(file) != path {
            return None;
        }
        let start = u64::from_str_radix(range.split('-').next()?, 16).ok()?;
        Some(start.wrapping_sub(offset))
    })
}
