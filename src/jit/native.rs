//! A compiled function: its executable mapping plus the tables that relate
//! machine code back to bytecode.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::JitError;
use super::abi::EntryFn;
use super::compiler::CompiledCode;
use super::memory::ExecutableMemory;
use super::offset_map::{Location, OffsetMap};
use crate::vm::ExecutionContext;

pub struct NativeExecutable {
    name: String,
    memory: ExecutableMemory,
    code_size: usize,
    offset_map: OffsetMap,
    resume_offsets: Vec<u32>,
}

/// Sidecar written next to a machine-code dump.
#[derive(Serialize)]
struct DumpMetadata<'a> {
    name: &'a str,
    code_size: usize,
    resume_offsets: &'a [u32],
    offset_map: &'a OffsetMap,
}

impl NativeExecutable {
    pub fn new(name: &str, compiled: CompiledCode) -> Result<Self, JitError> {
        let memory = ExecutableMemory::with_code(&compiled.code)?;
        Ok(Self {
            name: name.to_string(),
            memory,
            code_size: compiled.code.len(),
            offset_map: compiled.offset_map,
            resume_offsets: compiled.resume_offsets,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn code(&self) -> &[u8] {
        self.memory.bytes(self.code_size)
    }

    pub fn entry_address(&self) -> u64 {
        self.memory.as_ptr() as u64
    }

    pub fn offset_map(&self) -> &OffsetMap {
        &self.offset_map
    }

    /// The bytecode location a native address belongs to, if it lies in this
    /// function's code.
    pub fn bytecode_location_for(&self, address: u64) -> Option<Location> {
        let offset = address.checked_sub(self.entry_address())?;
        if offset >= self.code_size as u64 {
            return None;
        }
        self.offset_map.lookup(offset as usize)
    }

    /// Whether `address` is the start of a block some `Yield`/`Await` resumes
    /// into. Anything else must never be jumped to.
    pub fn is_resume_address(&self, address: u64) -> bool {
        address
            .checked_sub(self.entry_address())
            .and_then(|offset| u32::try_from(offset).ok())
            .is_some_and(|offset| self.resume_offsets.binary_search(&offset).is_ok())
    }

    /// Enter the compiled code. `resume` is 0 for a fresh call or a validated
    /// resume address.
    ///
    /// # Safety
    ///
    /// `context` must be a live frame of the executable this was compiled
    /// from, not concurrently accessed, and `resume` must satisfy
    /// [`Self::is_resume_address`] when non-zero.
    pub unsafe fn run(&self, context: &ExecutionContext, resume: u64) {
        debug_assert!(resume == 0 || self.is_resume_address(resume));
        // SAFETY: the mapping holds code emitted for `EntryFn`.
        unsafe {
            let entry: EntryFn = std::mem::transmute(self.memory.as_ptr());
            entry(
                std::ptr::null(),
                context.registers_ptr(),
                context.locals_ptr(),
                resume,
                context as *const ExecutionContext,
            );
        }
    }

    /// Write the raw code to `<dir>/<name>.bin` and the offset map to
    /// `<dir>/<name>.json`. Returns the path of the code file.
    pub fn dump(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let stem = sanitize(&self.name);
        let code_path = dir.join(format!("{stem}.bin"));
        fs::write(&code_path, self.code())?;
        let metadata = DumpMetadata {
            name: &self.name,
            code_size: self.code_size,
            resume_offsets: &self.resume_offsets,
            offset_map: &self.offset_map,
        };
        let json = serde_json::to_string_pretty(&metadata).map_err(io::Error::other)?;
        fs::write(dir.join(format!("{stem}.json")), json)?;
        Ok(code_path)
    }
}

impl std::fmt::Debug for NativeExecutable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeExecutable")
            .field("name", &self.name)
            .field("entry", &format_args!("{:#x}", self.entry_address()))
            .field("code_size", &self.code_size)
            .finish()
    }
}

fn sanitize(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() { "anonymous".to_string() } else { stem }
}

/// `/tmp/perf-<pid>.map`, the symbol file `perf` reads for JIT code.
pub struct PerfMap {
    file: File,
    path: PathBuf,
}

impl PerfMap {
    pub fn open() -> io::Result<Self> {
        Self::open_at(PathBuf::from(format!("/tmp/perf-{}.map", std::process::id())))
    }

    pub fn open_at(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, native: &NativeExecutable) -> io::Result<()> {
        writeln!(
            self.file,
            "{:x} {:x} kiln:{}",
            native.entry_address(),
            native.code_size(),
            native.name()
        )
    }
}

#[cfg(all(test, target_arch = "x86_64", unix))]
mod tests {
    use super::*;
    use crate::jit::compiler;
    use crate::vm::{ExecutableBuilder, Instruction};

    fn generator() -> NativeExecutable {
        let mut b = ExecutableBuilder::new("gen/one");
        let entry = b.make_block("entry");
        let next = b.make_block("next");
        b.emit(entry, Instruction::Yield { continuation: Some(next) });
        b.emit(next, Instruction::Return);
        let exe = b.build().unwrap();
        NativeExecutable::new(&exe.name, compiler::compile(&exe).unwrap()).unwrap()
    }

    #[test]
    fn test_resume_addresses_are_exact() {
        let native = generator();
        let base = native.entry_address();
        let offset = native.resume_offsets[0] as u64;
        assert!(native.is_resume_address(base + offset));
        assert!(!native.is_resume_address(base + offset + 1));
        assert!(!native.is_resume_address(base));
        assert!(!native.is_resume_address(0));
    }

    #[test]
    fn test_bytecode_location_for_address() {
        let native = generator();
        let base = native.entry_address();
        assert_eq!(native.bytecode_location_for(base), Some(Location::Prologue));
        let resume = base + native.resume_offsets[0] as u64;
        assert_eq!(
            native.bytecode_location_for(resume),
            Some(Location::Instruction { block: 1, index: 0 })
        );
        assert_eq!(native.bytecode_location_for(base + native.code_size() as u64), None);
    }

    #[test]
    fn test_dump_writes_code_and_offsets() {
        let native = generator();
        let dir = tempfile::tempdir().unwrap();
        let path = native.dump(dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "gen_one.bin");
        assert_eq!(fs::read(&path).unwrap(), native.code());
        let json = fs::read_to_string(dir.path().join("gen_one.json")).unwrap();
        assert!(json.contains("\"prologue\""));
    }

    #[test]
    fn test_perf_map_line_format() {
        let native = generator();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.map");
        let mut map = PerfMap::open_at(path.clone()).unwrap();
        map.record(&native).unwrap();
        let line = fs::read_to_string(&path).unwrap();
        assert_eq!(
            line,
            format!("{:x} {:x} kiln:gen/one\n", native.entry_address(), native.code_size())
        );
    }
}
