//! User-space symbols from the ELF files recorded in map frames

use super::{ResolvedSymbol, SymbolResolver};
use crate::context::AddressContext;
use crate::error::AnalysisError;
use crate::scan::for_each_frame;
use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use symbolic_common::Name;
use symbolic_demangle::{Demangle, DemangleOptions};
use tokio_util::sync::CancellationToken;
use tracefold_capture::{Address, CaptureReader, FrameBody, Map, Pid, Timestamp};
use tracing::{debug, warn};

const SYSTEM_PREFIXES: &[&str] = &["/usr/lib", "/usr/lib64", "/lib", "/lib64"];

/// (file name fragment, tag)
const KNOWN_LIBRARIES: &[(&str, &str)] = &[
    ("/libc.so", "libc"),
    ("/libc-", "libc"),
    ("/libpthread", "libc"),
    ("/libm.so", "libc"),
    ("/ld-linux", "Loader"),
    ("/libstdc++", "stdc++"),
    ("/libglib-2", "GLib"),
    ("/libgobject-2", "GObject"),
    ("/libgio-2", "Gio"),
    ("/libgtk-", "GTK"),
    ("/libpango", "Pango"),
    ("/libcairo", "Cairo"),
    ("/libharfbuzz", "Harfbuzz"),
    ("/libwayland", "Wayland"),
    ("/libEGL", "EGL"),
    ("/libGL", "Mesa"),
    ("/libLLVM", "LLVM"),
];

fn guess_tag(filename: &str) -> Option<&'static str> {
    KNOWN_LIBRARIES
        .iter()
        .find(|(fragment, _)| filename.contains(fragment))
        .map(|(_, tag)| *tag)
}

fn is_system_library(filename: &str) -> bool {
    SYSTEM_PREFIXES
        .iter()
        .any(|prefix| filename.starts_with(prefix) && filename[prefix.len()..].starts_with('/'))
}

fn demangle(raw: &str) -> String {
    Name::from(raw)
        .try_demangle(DemangleOptions::name_only())
        .into_owned()
}

/// Symbol table of one ELF file
struct ElfImage {
    inode: Option<u64>,
    /// (file offset, file size, virtual address)
    segments: Vec<(u64, u64, u64)>,
    /// (address, size, demangled name), sorted by address
    symbols: Vec<(u64, u64, String)>,
}

impl ElfImage {
    fn load(path: &Path) -> Result<Self, String> {
        let data = std::fs::read(path).map_err(|e| e.to_string())?;
        let file = object::File::parse(&*data).map_err(|e| e.to_string())?;

        let segments = file
            .segments()
            .map(|segment| {
                let (offset, size) = segment.file_range();
                (offset, size, segment.address())
            })
            .collect();

        let mut symbols: Vec<(u64, u64, String)> = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter(|symbol| symbol.kind() == SymbolKind::Text && symbol.address() != 0)
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                Some((symbol.address(), symbol.size(), demangle(name)))
            })
            .collect();
        symbols.sort_by_key(|(address, _, _)| *address);
        symbols.dedup_by_key(|(address, _, _)| *address);

        Ok(Self {
            inode: file_inode(path),
            segments,
            symbols,
        })
    }

    /// None when the segment arithmetic overflows
    fn file_offset_to_vaddr(&self, offset: u64) -> Option<u64> {
        let segment = self.segments.iter().find(|(start, size, _)| {
            offset >= *start && start.checked_add(*size).is_some_and(|end| offset < end)
        });
        match segment {
            Some((start, _, vaddr)) => (offset - start).checked_add(*vaddr),
            None => Some(offset),
        }
    }

    fn lookup(&self, vaddr: u64) -> Option<&str> {
        let idx = self.symbols.partition_point(|(address, _, _)| *address <= vaddr);
        let (address, size, name) = self.symbols[..idx].last()?;
        let covered = *size == 0 || address.checked_add(*size).map_or(true, |end| vaddr < end);
        covered.then_some(name.as_str())
    }
}

#[cfg(unix)]
fn file_inode(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.ino())
}

#[cfg(not(unix))]
fn file_inode(_path: &Path) -> Option<u64> {
    None
}

/// Resolves user-space addresses by locating the mapped file, translating
/// the address into the file and looking it up in the file's symbol table.
#[derive(Default)]
pub struct ElfSymbolResolver {
    maps: HashMap<Pid, Vec<(Timestamp, Map)>>,
    /// None records a file that could not be loaded
    images: HashMap<String, Option<Arc<ElfImage>>>,
    root: Option<PathBuf>,
}

impl ElfSymbolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look files up beneath `root` (e.g. a container's filesystem)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn add_map(&mut self, time: Timestamp, pid: Pid, map: Map) {
        self.maps.entry(pid).or_default().push((time, map));
    }

    /// The newest mapping covering `address` that existed at `time`,
    /// otherwise any mapping covering it
    fn find_map(&self, time: Timestamp, pid: Pid, address: Address) -> Option<&Map> {
        let maps = self.maps.get(&pid)?;
        let mut covering = maps
            .iter()
            .rev()
            .filter(|(_, map)| map.start <= address && address < map.end);
        let first = covering.clone().next();
        covering
            .find(|(mapped_at, _)| *mapped_at <= time)
            .or(first)
            .map(|(_, map)| map)
    }

    fn image(&mut self, filename: &str) -> Option<Arc<ElfImage>> {
        if let Some(cached) = self.images.get(filename) {
            return cached.clone();
        }
        let path = match &self.root {
            Some(root) => root.join(filename.trim_start_matches('/')),
            None => PathBuf::from(filename),
        };
        let image = match ElfImage::load(&path) {
            Ok(image) => {
                debug!("Loaded {} symbols from {}", image.symbols.len(), path.display());
                Some(Arc::new(image))
            }
            Err(e) => {
                warn!("Failed to load symbols from {}: {}", path.display(), e);
                None
            }
        };
        self.images.insert(filename.to_string(), image.clone());
        image
    }
}

impl SymbolResolver for ElfSymbolResolver {
    fn name(&self) -> &'static str {
        "elf"
    }

    fn load(
        &mut self,
        reader: &mut CaptureReader,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        self.maps.clear();
        for_each_frame(reader, cancel, |frame| {
            if let FrameBody::Map(map) = frame.body {
                self.add_map(frame.header.time, frame.header.pid, map);
            }
        })
    }

    fn resolve(
        &mut self,
        time: Timestamp,
        pid: Pid,
        context: AddressContext,
        address: Address,
    ) -> Option<ResolvedSymbol> {
        if context != AddressContext::User {
            return None;
        }
        let map = self.find_map(time, pid, address)?.clone();
        // Map fields come from the capture and may be garbage
        let file_offset = (address - map.start).checked_add(map.offset);
        let tag = guess_tag(&map.filename).map(str::to_string);
        let system_library = is_system_library(&map.filename);
        let basename = map
            .filename
            .rsplit('/')
            .next()
            .unwrap_or(map.filename.as_str());

        let name = match self.image(&map.filename) {
            Some(image) if map.inode != 0 && image.inode.is_some_and(|ino| ino != map.inode) => {
                format!("{}: inode mismatch", map.filename)
            }
            Some(image) => match file_offset
                .and_then(|offset| image.file_offset_to_vaddr(offset))
                .and_then(|vaddr| image.lookup(vaddr))
            {
                Some(name) => name.to_string(),
                None => format!("In File {}", basename),
            },
            None => format!("In File {}", basename),
        };

        Some(ResolvedSymbol {
            name,
            tag,
            system_library,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_and_system_paths() {
        assert_eq!(guess_tag("/usr/lib64/libc.so.6"), Some("libc"));
        assert_eq!(guess_tag("/usr/lib/libglib-2.0.so.0"), Some("GLib"));
        assert_eq!(guess_tag("/home/me/app"), None);

        assert!(is_system_library("/usr/lib64/libc.so.6"));
        assert!(is_system_library("/lib/x86_64-linux-gnu/libm.so.6"));
        assert!(!is_system_library("/usr/libexec/helper"));
        assert!(!is_system_library("/opt/app/lib/libfoo.so"));
    }

    #[test]
    fn test_demangle() {
        assert_eq!(demangle("_ZN3foo3barEv"), "foo::bar");
        assert_eq!(demangle("plain_c_symbol"), "plain_c_symbol");
    }

    #[test]
    fn test_missing_file_names_the_file() {
        let mut resolver = ElfSymbolResolver::new();
        resolver.add_map(
            0,
            9,
            Map {
                start: 0x1000,
                end: 0x2000,
                offset: 0,
                inode: 0,
                filename: "/nonexistent/libtracefold-test.so".into(),
            },
        );

        let hit = resolver
            .resolve(5, 9, AddressContext::User, 0x1500)
            .unwrap();
        assert_eq!(hit.name, "In File libtracefold-test.so");
        assert!(resolver
            .resolve(5, 9, AddressContext::Kernel, 0x1500)
            .is_none());
        assert!(resolver.resolve(5, 9, AddressContext::User, 0x2000).is_none());
    }

    #[test]
    fn test_overflowing_map_offset_falls_back_to_file() {
        let mut resolver = ElfSymbolResolver::new();
        resolver.add_map(
            0,
            1,
            Map {
                start: 0x1000,
                end: 0x2000,
                offset: u64::MAX,
                inode: 0,
                filename: "/proc/self/exe".into(),
            },
        );

        let hit = resolver
            .resolve(0, 1, AddressContext::User, 0x1800)
            .unwrap();
        assert_eq!(hit.name, "In File exe");
    }

    #[test]
    fn test_segment_and_symbol_bounds_saturate() {
        let image = ElfImage {
            inode: None,
            segments: vec![(0x10, 0x1000, u64::MAX - 4)],
            symbols: vec![(u64::MAX - 8, u64::MAX, "tail".to_string())],
        };
        assert_eq!(image.file_offset_to_vaddr(0x100), None);
        assert_eq!(image.file_offset_to_vaddr(0x8), Some(0x8));
        assert_eq!(image.lookup(u64::MAX - 1), Some("tail"));
    }

    #[test]
    fn test_newest_map_wins() {
        let map = |filename: &str| Map {
            start: 0x1000,
            end: 0x2000,
            offset: 0,
            inode: 0,
            filename: filename.into(),
        };
        let mut resolver = ElfSymbolResolver::new();
        resolver.add_map(10, 1, map("/nonexistent/old.so"));
        resolver.add_map(20, 1, map("/nonexistent/new.so"));

        assert_eq!(resolver.find_map(15, 1, 0x1800).unwrap().filename, "/nonexistent/old.so");
        assert_eq!(resolver.find_map(25, 1, 0x1800).unwrap().filename, "/nonexistent/new.so");
        assert_eq!(resolver.find_map(5, 1, 0x1800).unwrap().filename, "/nonexistent/new.so");
    }

    #[cfg(target_os = "linux")]
    #[inline(never)]
    fn tracefold_marker_function() -> usize {
        std::hint::black_box(42)
    }

    /// The mapping of the running test binary containing `address`
    #[cfg(target_os = "linux")]
    fn self_mapping(address: u64) -> Map {
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
        maps.lines()
            .find_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                let (start, end) = fields[0].split_once('-')?;
                let start = u64::from_str_radix(start, 16).ok()?;
                let end = u64::from_str_radix(end, 16).ok()?;
                (start <= address && address < end && fields.len() >= 6).then(|| Map {
                    start,
                    end,
                    offset: u64::from_str_radix(fields[2], 16).unwrap(),
                    inode: fields[4].parse().unwrap(),
                    filename: fields[5].to_string(),
                })
            })
            .unwrap()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resolves_own_binary() {
        assert_eq!(tracefold_marker_function(), 42);
        let address = tracefold_marker_function as usize as u64;
        let map = self_mapping(address);

        let mut resolver = ElfSymbolResolver::new();
        resolver.add_map(0, 1, map.clone());
        let hit = resolver
            .resolve(0, 1, AddressContext::User, address)
            .unwrap();
        assert!(hit.name.contains("tracefold_marker_function"), "{}", hit.name);
        assert!(!hit.system_library);

        let mut mismatched = ElfSymbolResolver::new();
        mismatched.add_map(
            0,
            1,
            Map {
                inode: map.inode + 1,
                ..map.clone()
            },
        );
        let hit = mismatched
            .resolve(0, 1, AddressContext::User, address)
            .unwrap();
        assert_eq!(hit.name, format!("{}: inode mismatch", map.filename));
    }
}
