// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Arena allocator (§4.1): a single large mapping that backs every mempool,
// ioqueue and channel registry entry an `io_ctx` owns. Local-primary and
// ipc-primary roles try, in order:
//
//   1. 1GiB persistent hugetlbfs (a file on a mounted hugetlbfs, sized and
//      requested by the caller's run-path/namespace)
//   2. 1GiB anonymous transparent huge pages
//   3. 2MiB persistent hugetlbfs
//   4. 2MiB anonymous transparent huge pages
//   5. plain anonymous memory, rounded up to `MEM_BLOCK_SIZE`
//
// A shared arena additionally writes a sidecar metadata file under
// `<run_path>/<namespace>/<name>` recording which tier succeeded and (for
// the persistent-hugetlbfs tiers) the backing mount point, so an ipc peer
// attaching later maps the same kind of memory at the same size.

use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use crate::error::{IoError, Result};

pub const HUGEPAGE_SIZE_1GB: usize = 1 << 30;
pub const HUGEPAGE_SIZE_2MB: usize = 1 << 21;

/// Plain-mmap allocations are rounded up to this granularity, matching
/// the block size jbpf uses for its own sub-allocator arena.
pub const MEM_BLOCK_SIZE: usize = 1 << 25;

const THP_ENABLED_PATH: &str = "/sys/kernel/mm/transparent_hugepage/enabled";
const MOUNTS_PATH: &str = "/proc/mounts";

#[cfg(target_os = "linux")]
const MAP_HUGE_1GB: i32 = 30 << 26; // MAP_HUGE_SHIFT == 26
#[cfg(target_os = "linux")]
const MAP_HUGE_2MB: i32 = 21 << 26;

/// Which tier of the allocation cascade an arena actually landed on. Recorded
/// in the sidecar metadata file so an attaching peer can reproduce the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Hugepage1GPersistent,
    Hugepage1GAnonymous,
    Hugepage2MPersistent,
    Hugepage2MAnonymous,
    Plain,
}

impl Backing {
    fn tag(self) -> u8 {
        match self {
            Backing::Hugepage1GPersistent => 1,
            Backing::Hugepage1GAnonymous => 2,
            Backing::Hugepage2MPersistent => 3,
            Backing::Hugepage2MAnonymous => 4,
            Backing::Plain => 5,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Backing::Hugepage1GPersistent),
            2 => Some(Backing::Hugepage1GAnonymous),
            3 => Some(Backing::Hugepage2MPersistent),
            4 => Some(Backing::Hugepage2MAnonymous),
            5 => Some(Backing::Plain),
            _ => None,
        }
    }
}

/// Whether the caller wants huge pages at all, or demands them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugepagePolicy {
    /// Try huge pages, silently fall back to plain memory.
    Prefer,
    /// Fail the allocation if no huge-page tier succeeds.
    Require,
    /// Skip straight to plain memory.
    Skip,
}

#[derive(Debug, Clone, Copy)]
struct HugetlbfsMount {
    page_size: usize,
    #[cfg(target_os = "linux")]
    flag: i32,
}

fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) / align * align
}

#[cfg(target_os = "linux")]
fn transparent_hp_enabled() -> bool {
    match fs::read_to_string(THP_ENABLED_PATH) {
        Ok(contents) => contents.contains("[always]") || contents.contains("[madvise]"),
        Err(_) => false,
    }
}

/// Parse `/proc/mounts` for hugetlbfs mount points and their page size.
#[cfg(target_os = "linux")]
fn discover_hugetlbfs_mounts() -> Vec<(PathBuf, HugetlbfsMount)> {
    let contents = match fs::read_to_string(MOUNTS_PATH) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    let mut out = Vec::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let mount_dir = match fields.next() {
            Some(d) => d,
            None => continue,
        };
        let fs_type = fields.next().unwrap_or("");
        if fs_type != "hugetlbfs" {
            continue;
        }
        let opts = fields.next().unwrap_or("");
        let page_kb = opts
            .split(',')
            .find_map(|o| o.strip_prefix("pagesize="))
            .and_then(parse_pagesize_kb);
        let page_kb = match page_kb {
            Some(kb) => kb,
            None => continue,
        };
        let (page_size, flag) = if page_kb == 1024 * 1024 {
            (HUGEPAGE_SIZE_1GB, MAP_HUGE_1GB)
        } else if page_kb == 2 * 1024 {
            (HUGEPAGE_SIZE_2MB, MAP_HUGE_2MB)
        } else {
            continue;
        };
        out.push((PathBuf::from(mount_dir), HugetlbfsMount { page_size, flag }));
    }
    out
}

/// `pagesize=1G` or `pagesize=2M` -> kibibytes.
#[cfg(target_os = "linux")]
fn parse_pagesize_kb(s: &str) -> Option<usize> {
    let (num, unit) = s.split_at(s.len().checked_sub(1)?);
    let n: usize = num.parse().ok()?;
    match unit {
        "G" | "g" => Some(n * 1024 * 1024),
        "M" | "m" => Some(n * 1024),
        "K" | "k" => Some(n),
        _ => None,
    }
}

fn find_mount(mounts: &[(PathBuf, HugetlbfsMount)], page_size: usize) -> Option<PathBuf> {
    mounts
        .iter()
        .find(|(_, m)| m.page_size == page_size)
        .map(|(p, _)| p.clone())
}

/// A single large mapping. Dropping it unmaps the region and, for shared
/// arenas the calling process created, removes the sidecar file and the
/// backing shm/hugetlbfs file.
pub struct Arena {
    addr: *mut u8,
    len: usize,
    backing: Backing,
    shared: bool,
    owns_backing_file: bool,
    fd: Option<RawFd>,
    backing_path: Option<PathBuf>,
    shm_name: Option<String>,
    sidecar_path: Option<PathBuf>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create a new arena of at least `size` bytes, running the hugepage
    /// preference cascade per `policy`. `name` is the arena's logical name;
    /// for a shared arena it also names the backing shm/hugetlbfs file and
    /// the sidecar metadata file under `namespace_dir`.
    pub fn create(
        namespace_dir: &Path,
        name: &str,
        size: usize,
        shared: bool,
        policy: HugepagePolicy,
    ) -> Result<Self> {
        if size == 0 {
            return Err(IoError::InvalidAddress("arena size must be non-zero".into()));
        }
        if shared {
            crate::config::ensure_namespace_dir(namespace_dir)?;
        }

        #[cfg(target_os = "linux")]
        {
            if policy != HugepagePolicy::Skip {
                let mounts = discover_hugetlbfs_mounts();
                for (backing, page_size, persistent) in [
                    (Backing::Hugepage1GPersistent, HUGEPAGE_SIZE_1GB, true),
                    (Backing::Hugepage1GAnonymous, HUGEPAGE_SIZE_1GB, false),
                    (Backing::Hugepage2MPersistent, HUGEPAGE_SIZE_2MB, true),
                    (Backing::Hugepage2MAnonymous, HUGEPAGE_SIZE_2MB, false),
                ] {
                    if persistent && !shared {
                        // Persistent hugetlbfs files are only meaningful for
                        // arenas another peer needs to attach to.
                        continue;
                    }
                    if !persistent && shared {
                        // An anonymous THP mapping is MAP_PRIVATE|MAP_ANONYMOUS
                        // with no fd and no named path for a second process to
                        // attach through; `Arena::attach` refuses these for
                        // exactly that reason, so never select one for a
                        // shared arena even when THP is enabled on the host.
                        continue;
                    }
                    if !persistent && !transparent_hp_enabled() {
                        continue;
                    }
                    let req = round_up(size, page_size);
                    let mount = if persistent {
                        match find_mount(&mounts, page_size) {
                            Some(m) => Some(m),
                            None => continue,
                        }
                    } else {
                        None
                    };
                    match Self::try_map(namespace_dir, name, req, shared, backing, mount.as_deref())
                    {
                        Ok(arena) => return Ok(arena),
                        Err(_) => continue,
                    }
                }
                if policy == HugepagePolicy::Require {
                    return Err(IoError::ArenaAllocFailed);
                }
            }
        }

        let req = round_up(size, MEM_BLOCK_SIZE);
        Self::try_map(namespace_dir, name, req, shared, Backing::Plain, None)
    }

    #[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
    fn try_map(
        namespace_dir: &Path,
        name: &str,
        size: usize,
        shared: bool,
        backing: Backing,
        hugetlbfs_mount: Option<&Path>,
    ) -> Result<Self> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let mut fd: Option<RawFd> = None;
        let mut backing_path: Option<PathBuf> = None;
        let mut shm_name_out: Option<String> = None;

        #[cfg(target_os = "linux")]
        {
            match backing {
                Backing::Hugepage1GPersistent | Backing::Hugepage2MPersistent => {
                    let mount = hugetlbfs_mount.ok_or(IoError::ArenaAllocFailed)?;
                    let path = mount.join(name);
                    let file = fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .open(&path)
                        .map_err(IoError::Io)?;
                    file.set_len(size as u64).map_err(IoError::Io)?;
                    let raw = std::os::unix::io::IntoRawFd::into_raw_fd(file);
                    flags = libc::MAP_SHARED | libc::MAP_HUGETLB;
                    flags |= if backing == Backing::Hugepage1GPersistent {
                        MAP_HUGE_1GB
                    } else {
                        MAP_HUGE_2MB
                    };
                    fd = Some(raw);
                    backing_path = Some(path);
                }
                Backing::Hugepage1GAnonymous | Backing::Hugepage2MAnonymous => {
                    flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE | libc::MAP_HUGETLB;
                    flags |= if backing == Backing::Hugepage1GAnonymous {
                        MAP_HUGE_1GB
                    } else {
                        MAP_HUGE_2MB
                    };
                }
                Backing::Plain => {
                    if shared {
                        let shm_name = crate::shm_name::make_shm_name(name);
                        let c_name = std::ffi::CString::new(shm_name.as_bytes())
                            .map_err(|e| IoError::InvalidAddress(e.to_string()))?;
                        let raw = unsafe {
                            libc::shm_open(
                                c_name.as_ptr(),
                                libc::O_RDWR | libc::O_CREAT,
                                0o666,
                            )
                        };
                        if raw == -1 {
                            return Err(IoError::Io(io::Error::last_os_error()));
                        }
                        if unsafe { libc::ftruncate(raw, size as libc::off_t) } != 0 {
                            let err = io::Error::last_os_error();
                            unsafe { libc::close(raw) };
                            return Err(IoError::Io(err));
                        }
                        flags = libc::MAP_SHARED;
                        fd = Some(raw);
                        shm_name_out = Some(shm_name);
                    } else {
                        flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE;
                    }
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (backing, hugetlbfs_mount);
            if shared {
                let shm_name = crate::shm_name::make_shm_name(name);
                let c_name = std::ffi::CString::new(shm_name.as_bytes())
                    .map_err(|e| IoError::InvalidAddress(e.to_string()))?;
                let raw =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o666) };
                if raw == -1 {
                    return Err(IoError::Io(io::Error::last_os_error()));
                }
                if unsafe { libc::ftruncate(raw, size as libc::off_t) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(raw) };
                    return Err(IoError::Io(err));
                }
                flags = libc::MAP_SHARED;
                fd = Some(raw);
                shm_name_out = Some(shm_name);
            }
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd.unwrap_or(-1),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            if let Some(raw) = fd {
                unsafe { libc::close(raw) };
            }
            return Err(IoError::Io(err));
        }

        unsafe {
            if libc::mlock(addr, size) != 0 {
                log::warn!("arena '{name}': mlock failed, continuing unlocked");
            }
            ptr::write_bytes(addr as *mut u8, 0, size);
        }

        let sidecar_path = if shared {
            let sidecar = namespace_dir.join(name);
            fs::write(&sidecar, [backing.tag()]).map_err(IoError::Io)?;
            Some(sidecar)
        } else {
            None
        };

        Ok(Self {
            addr: addr as *mut u8,
            len: size,
            backing,
            shared,
            owns_backing_file: true,
            fd,
            backing_path,
            shm_name: shm_name_out,
            sidecar_path,
        })
    }

    /// Attach to an arena a peer already created, reading its sidecar file
    /// to learn which backing kind to reproduce. `name` must match the
    /// creator's arena name exactly.
    pub fn attach(namespace_dir: &Path, name: &str, size: usize, fixed_addr: Option<*mut u8>) -> Result<Self> {
        let sidecar = namespace_dir.join(name);
        let tag = fs::read(&sidecar).map_err(IoError::Io)?;
        let backing = tag
            .first()
            .copied()
            .and_then(Backing::from_tag)
            .ok_or_else(|| IoError::InvalidAddress(format!("corrupt sidecar for arena '{name}'")))?;

        let (fd, flags, backing_path): (RawFd, i32, Option<PathBuf>) = match backing {
            #[cfg(target_os = "linux")]
            Backing::Hugepage1GPersistent | Backing::Hugepage2MPersistent => {
                let mounts = discover_hugetlbfs_mounts();
                let page_size = if backing == Backing::Hugepage1GPersistent {
                    HUGEPAGE_SIZE_1GB
                } else {
                    HUGEPAGE_SIZE_2MB
                };
                let mount = find_mount(&mounts, page_size).ok_or(IoError::ArenaAllocFailed)?;
                let path = mount.join(name);
                let file = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(IoError::Io)?;
                let raw = std::os::unix::io::IntoRawFd::into_raw_fd(file);
                let mut f = libc::MAP_SHARED | libc::MAP_HUGETLB;
                f |= if backing == Backing::Hugepage1GPersistent {
                    MAP_HUGE_1GB
                } else {
                    MAP_HUGE_2MB
                };
                (raw, f, Some(path))
            }
            #[cfg(not(target_os = "linux"))]
            Backing::Hugepage1GPersistent | Backing::Hugepage2MPersistent => {
                return Err(IoError::ArenaAllocFailed);
            }
            Backing::Hugepage1GAnonymous | Backing::Hugepage2MAnonymous => {
                return Err(IoError::InvalidAddress(
                    "cannot attach to an anonymous huge-page arena from another process".into(),
                ));
            }
            Backing::Plain => {
                let shm_name = crate::shm_name::make_shm_name(name);
                let c_name = std::ffi::CString::new(shm_name.as_bytes())
                    .map_err(|e| IoError::InvalidAddress(e.to_string()))?;
                let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666) };
                if raw == -1 {
                    return Err(IoError::Io(io::Error::last_os_error()));
                }
                (raw, libc::MAP_SHARED, None)
            }
        };

        let mut mmap_flags = flags;
        let hint = fixed_addr.unwrap_or(ptr::null_mut());
        if fixed_addr.is_some() {
            mmap_flags |= libc::MAP_FIXED_NOREPLACE;
        }
        let addr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                mmap_flags,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(IoError::Io(err));
        }

        Ok(Self {
            addr: addr as *mut u8,
            len: size,
            backing,
            shared: true,
            owns_backing_file: false,
            fd: Some(fd),
            backing_path,
            shm_name: None,
            sidecar_path: None,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.addr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn backing(&self) -> Backing {
        self.backing
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.len);
        }
        if let Some(fd) = self.fd.take() {
            unsafe { libc::close(fd) };
        }
        if self.owns_backing_file {
            if let Some(path) = &self.backing_path {
                let _ = fs::remove_file(path);
            } else if let Some(shm_name) = &self.shm_name {
                if let Ok(c_name) = std::ffi::CString::new(shm_name.as_bytes()) {
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                }
            }
            if let Some(sidecar) = &self.sidecar_path {
                let _ = fs::remove_file(sidecar);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn unique_dir() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("jbpf-arena-test-{}-{}", std::process::id(), n))
    }

    #[test]
    fn private_plain_arena_round_trips_data() {
        let dir = unique_dir();
        let arena = Arena::create(&dir, "priv", 4096, false, HugepagePolicy::Skip).unwrap();
        unsafe {
            arena.as_mut_ptr().write(0x42);
            assert_eq!(arena.as_ptr().read(), 0x42);
        }
        assert!(arena.len() >= 4096);
        assert_eq!(arena.backing(), Backing::Plain);
    }

    #[test]
    fn shared_plain_arena_writes_sidecar_and_cleans_up() {
        let dir = unique_dir();
        let name = format!("shared-{}", COUNTER.fetch_add(1, Ordering::Relaxed));
        let sidecar = dir.join(&name);
        {
            let _arena = Arena::create(&dir, &name, 4096, true, HugepagePolicy::Skip).unwrap();
            assert!(sidecar.exists());
        }
        assert!(!sidecar.exists());
        let _ = fs::remove_dir(&dir);
    }

    #[test]
    fn shared_plain_arena_unlinks_backing_shm_segment_on_drop() {
        let dir = unique_dir();
        let name = format!("shared-unlink-{}", COUNTER.fetch_add(1, Ordering::Relaxed));
        let shm_name = crate::shm_name::make_shm_name(&name);
        let c_name = std::ffi::CString::new(shm_name.as_bytes()).unwrap();
        {
            let _arena = Arena::create(&dir, &name, 4096, true, HugepagePolicy::Skip).unwrap();
            // While the arena is alive a second process could still open the
            // same segment by name.
            let probe = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
            assert!(probe >= 0, "backing shm segment must exist while the arena is live");
            unsafe { libc::close(probe) };
        }
        let probe = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        assert!(probe < 0, "dropping the arena must shm_unlink its backing segment");
        let _ = fs::remove_dir(&dir);
    }

    #[test]
    fn zero_size_is_rejected() {
        let dir = unique_dir();
        assert!(Arena::create(&dir, "zero", 0, false, HugepagePolicy::Skip).is_err());
    }
}
