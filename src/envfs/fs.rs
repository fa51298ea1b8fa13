use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fuse_backend_rs::api::filesystem::{
    Context, DirEntry, Entry, FileSystem, FsOptions, GetxattrReply, ListxattrReply, OpenOptions,
    ZeroCopyWriter,
};
use nix::errno::Errno;
use nix::fcntl::{openat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{access, AccessFlags};
use tracing::trace;

use super::inode::{Inode, InodeTable, ROOT_INO};

/// Entry and attribute validity advertised to the kernel.
const TIMEOUT: Duration = Duration::from_secs(1);

/// Write permission bits, masked off every mode this filesystem surfaces.
const WRITE_BITS: u32 = 0o222;

/// The two views exposed under the mount root.
const EXE_VIEW: &str = "exe";
const RAW_VIEW: &str = "raw";

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

fn enodata() -> io::Error {
    io::Error::from_raw_os_error(libc::ENODATA)
}

fn eacces() -> io::Error {
    io::Error::from_raw_os_error(libc::EACCES)
}

fn eisdir() -> io::Error {
    io::Error::from_raw_os_error(libc::EISDIR)
}

fn ebadf() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

fn erange() -> io::Error {
    io::Error::from_raw_os_error(libc::ERANGE)
}

fn nix_to_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

fn stat_at(dirfd: RawFd, path: &str, flags: libc::c_int) -> io::Result<libc::stat64> {
    let c_path = CString::new(path).map_err(|_| einval())?;
    let mut st = MaybeUninit::<libc::stat64>::zeroed();
    let res = unsafe { libc::fstatat64(dirfd, c_path.as_ptr(), st.as_mut_ptr(), flags) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { st.assume_init() })
}

fn readlink_at(dirfd: RawFd, path: &str) -> io::Result<Vec<u8>> {
    let c_path = CString::new(path).map_err(|_| einval())?;
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let len = unsafe {
        libc::readlinkat(dirfd, c_path.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
    };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(len as usize);
    Ok(buf)
}

/// Regular files with any execute bit are presented, through the exe view,
/// as the run trampoline.
fn rewrites_to_trampoline(st: &libc::stat64, raw: bool) -> bool {
    !raw && st.st_mode & libc::S_IFMT == libc::S_IFREG && st.st_mode & 0o111 != 0
}

fn wants_write(flags: u32) -> bool {
    let accmode = flags as i32 & libc::O_ACCMODE;
    accmode == libc::O_WRONLY
        || accmode == libc::O_RDWR
        || flags as i32 & (libc::O_APPEND | libc::O_TRUNC) != 0
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn entry(ino: u64, attr: libc::stat64) -> Entry {
    Entry {
        inode: ino,
        generation: 0,
        attr,
        attr_flags: 0,
        attr_timeout: TIMEOUT,
        entry_timeout: TIMEOUT,
    }
}

fn root_attr(ctx: &Context) -> libc::stat64 {
    let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
    st.st_ino = ROOT_INO;
    st.st_mode = libc::S_IFDIR | (0o755 & !WRITE_BITS);
    st.st_nlink = 4;
    st.st_uid = ctx.uid;
    st.st_gid = ctx.gid;
    st
}

/// An open directory stream. Wraps a DIR* so readdir can seek to whatever
/// offset the kernel asks for.
struct DirStream {
    dir: NonNull<libc::DIR>,
    offset: u64,
}

// DIR* is only ever used under the owning handle's mutex.
unsafe impl Send for DirStream {}

impl DirStream {
    fn open(dirfd: RawFd, path: &str) -> io::Result<Self> {
        let rel = if path.is_empty() { "." } else { path };
        let fd = openat(
            unsafe { BorrowedFd::borrow_raw(dirfd) },
            rel,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(nix_to_io)?
        .into_raw_fd();
        let dir = unsafe { libc::fdopendir(fd) };
        let Some(dir) = NonNull::new(dir) else {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        };
        Ok(Self { dir, offset: 0 })
    }

    fn seek(&mut self, offset: u64) {
        unsafe { libc::seekdir(self.dir.as_ptr(), offset as libc::c_long) };
        self.offset = offset;
    }

    fn next(&mut self) -> io::Result<Option<(u64, u64, u8, Vec<u8>)>> {
        Errno::clear();
        let dirent = unsafe { libc::readdir64(self.dir.as_ptr()) };
        if dirent.is_null() {
            let errno = io::Error::last_os_error();
            if errno.raw_os_error().unwrap_or(0) != 0 {
                return Err(errno);
            }
            return Ok(None);
        }
        let dirent = unsafe { &*dirent };
        let name = unsafe { CStr::from_ptr(dirent.d_name.as_ptr()) };
        self.offset = dirent.d_off as u64;
        Ok(Some((
            dirent.d_ino,
            dirent.d_off as u64,
            dirent.d_type,
            name.to_bytes().to_vec(),
        )))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir.as_ptr()) };
    }
}

enum DirHandle {
    /// The mount root synthesizes its listing; there is nothing to stream.
    Root,
    Stream(Mutex<DirStream>),
}

/// A path-only fd for an inode. The empty path is the source fd itself and
/// must never be closed here.
enum PathFd {
    Source(RawFd),
    Owned(OwnedFd),
}

impl PathFd {
    fn proc_path(&self) -> String {
        let fd = match self {
            PathFd::Source(fd) => *fd,
            PathFd::Owned(fd) => fd.as_raw_fd(),
        };
        format!("/proc/self/fd/{fd}")
    }
}

/// Read-only mirror of one container's root filesystem with two views:
/// `raw` passes everything through, `exe` substitutes the run trampoline
/// for executable regular files.
pub struct EnvFs {
    /// O_PATH descriptor for /proc/<pid>/root; every path below resolves
    /// relative to it.
    source: OwnedFd,
    /// Host binary substituted for executables in the exe view.
    trampoline: PathBuf,
    inodes: InodeTable,
    files: Mutex<HashMap<u64, Arc<File>>>,
    dirs: Mutex<HashMap<u64, Arc<DirHandle>>>,
    next_handle: AtomicU64,
}

impl EnvFs {
    pub fn new(source: OwnedFd, trampoline: PathBuf) -> Self {
        Self {
            source,
            trampoline,
            inodes: InodeTable::new(),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn source_fd(&self) -> RawFd {
        self.source.as_raw_fd()
    }

    fn get(&self, ino: u64) -> io::Result<Arc<Inode>> {
        self.inodes.get(ino).ok_or_else(ebadf)
    }

    fn stat_trampoline(&self) -> io::Result<libc::stat64> {
        let path = self.trampoline.to_str().ok_or_else(einval)?;
        stat_at(libc::AT_FDCWD, path, 0)
    }

    /// Attributes of (path, view), with the exe substitution applied and
    /// write bits masked.
    fn stat_inode(&self, path: &str, raw: bool) -> io::Result<libc::stat64> {
        let mut st = if path.is_empty() {
            stat_at(self.source_fd(), "", libc::AT_EMPTY_PATH)?
        } else {
            stat_at(self.source_fd(), path, libc::AT_SYMLINK_NOFOLLOW)?
        };
        if rewrites_to_trampoline(&st, raw) {
            st = self.stat_trampoline()?;
        }
        st.st_mode &= !WRITE_BITS;
        Ok(st)
    }

    fn do_lookup(&self, parent: u64, name: &str) -> io::Result<Entry> {
        if parent == ROOT_INO {
            let raw = match name {
                EXE_VIEW => false,
                RAW_VIEW => true,
                _ => return Err(enoent()),
            };
            // both views carry the attributes of the container root
            let mut st = stat_at(self.source_fd(), "", libc::AT_EMPTY_PATH)?;
            st.st_mode &= !WRITE_BITS;
            let inode = self.inodes.intern(String::new(), raw);
            return Ok(entry(inode.ino, st));
        }
        let parent = self.get(parent)?;
        let path = join_path(&parent.path, name);
        let st = self.stat_inode(&path, parent.raw)?;
        let inode = self.inodes.intern(path, parent.raw);
        Ok(entry(inode.ino, st))
    }

    /// Open the file an inode designates: the source fd round-tripped
    /// through /proc for the view root, the trampoline for exe-view
    /// executables, the underlying file otherwise.
    fn open_inode(&self, inode: &Inode) -> io::Result<File> {
        if inode.path.is_empty() {
            return File::open(format!("/proc/self/fd/{}", self.source_fd()));
        }
        let st = stat_at(self.source_fd(), &inode.path, libc::AT_SYMLINK_NOFOLLOW)?;
        if rewrites_to_trampoline(&st, inode.raw) {
            return File::open(&self.trampoline);
        }
        let fd = openat(
            unsafe { BorrowedFd::borrow_raw(self.source_fd()) },
            inode.path.as_str(),
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(nix_to_io)?
        .into_raw_fd();
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    /// Path-only fd used for the /proc/self/fd reopen trick. The empty
    /// path hands back the source fd itself, undup'd; disposing it is a
    /// no-op.
    fn path_fd(&self, inode: &Inode) -> io::Result<PathFd> {
        if inode.path.is_empty() {
            return Ok(PathFd::Source(self.source_fd()));
        }
        let fd = openat(
            unsafe { BorrowedFd::borrow_raw(self.source_fd()) },
            inode.path.as_str(),
            OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(nix_to_io)?;
        Ok(PathFd::Owned(fd))
    }

    fn new_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl FileSystem for EnvFs {
    type Inode = u64;
    type Handle = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::ASYNC_READ | FsOptions::PARALLEL_DIROPS)
    }

    fn lookup(&self, _ctx: &Context, parent: u64, name: &CStr) -> io::Result<Entry> {
        let name = name.to_str().map_err(|_| einval())?;
        let entry = self.do_lookup(parent, name)?;
        trace!(parent, name, inode = entry.inode, "lookup");
        Ok(entry)
    }

    fn forget(&self, _ctx: &Context, inode: u64, count: u64) {
        self.inodes.forget(inode, count);
    }

    fn batch_forget(&self, _ctx: &Context, requests: Vec<(u64, u64)>) {
        self.inodes.forget_multi(&requests);
    }

    fn getattr(
        &self,
        ctx: &Context,
        inode: u64,
        _handle: Option<u64>,
    ) -> io::Result<(libc::stat64, Duration)> {
        if inode == ROOT_INO {
            return Ok((root_attr(ctx), TIMEOUT));
        }
        let inode = self.get(inode)?;
        Ok((self.stat_inode(&inode.path, inode.raw)?, TIMEOUT))
    }

    fn readlink(&self, _ctx: &Context, inode: u64) -> io::Result<Vec<u8>> {
        if inode == ROOT_INO {
            return Err(einval());
        }
        let inode = self.get(inode)?;
        if inode.path.is_empty() {
            return Err(einval());
        }
        readlink_at(self.source_fd(), &inode.path)
    }

    fn open(
        &self,
        _ctx: &Context,
        inode: u64,
        flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<u64>, OpenOptions, Option<u32>)> {
        if inode == ROOT_INO {
            return Err(eisdir());
        }
        if wants_write(flags) {
            return Err(eacces());
        }
        let inode = self.get(inode)?;
        let file = self.open_inode(&inode)?;
        let handle = self.new_handle();
        self.files.lock().unwrap().insert(handle, Arc::new(file));
        Ok((Some(handle), OpenOptions::empty(), None))
    }

    fn read(
        &self,
        _ctx: &Context,
        _inode: u64,
        handle: u64,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let file = self
            .files
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or_else(ebadf)?;
        // splice straight from the backing fd; borrow it without a dup
        let borrowed = unsafe { File::from_raw_fd(file.as_raw_fd()) };
        let mut borrowed = ManuallyDrop::new(borrowed);
        w.write_from(&mut *borrowed, size as usize, offset)
    }

    fn release(
        &self,
        _ctx: &Context,
        _inode: u64,
        _flags: u32,
        handle: u64,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        // close errors stay here; the kernel has no use for them
        self.files.lock().unwrap().remove(&handle);
        Ok(())
    }

    fn opendir(
        &self,
        _ctx: &Context,
        inode: u64,
        _flags: u32,
    ) -> io::Result<(Option<u64>, OpenOptions)> {
        let dir = if inode == ROOT_INO {
            DirHandle::Root
        } else {
            let inode = self.get(inode)?;
            DirHandle::Stream(Mutex::new(DirStream::open(self.source_fd(), &inode.path)?))
        };
        let handle = self.new_handle();
        self.dirs.lock().unwrap().insert(handle, Arc::new(dir));
        Ok((Some(handle), OpenOptions::empty()))
    }

    fn readdir(
        &self,
        _ctx: &Context,
        _inode: u64,
        handle: u64,
        size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        if size == 0 {
            return Ok(());
        }
        let dir = self
            .dirs
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or_else(ebadf)?;
        match &*dir {
            DirHandle::Root => {
                const ROOT_ENTRIES: [&str; 4] = [".", "..", EXE_VIEW, RAW_VIEW];
                for (i, name) in ROOT_ENTRIES.iter().enumerate().skip(offset as usize) {
                    let used = add_entry(DirEntry {
                        ino: i as u64 + 1,
                        offset: i as u64 + 1,
                        type_: libc::DT_DIR as u32,
                        name: name.as_bytes(),
                    })?;
                    if used == 0 {
                        break;
                    }
                }
                Ok(())
            }
            DirHandle::Stream(stream) => {
                let mut stream = stream.lock().unwrap();
                if stream.offset != offset {
                    stream.seek(offset);
                }
                while let Some((ino, next_offset, kind, name)) = stream.next()? {
                    let used = add_entry(DirEntry {
                        ino,
                        offset: next_offset,
                        type_: kind as u32,
                        name: &name,
                    })?;
                    if used == 0 {
                        // did not fit; the kernel will retry from the last
                        // accepted offset and we seek back then
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    fn releasedir(&self, _ctx: &Context, _inode: u64, _flags: u32, handle: u64) -> io::Result<()> {
        self.dirs.lock().unwrap().remove(&handle);
        Ok(())
    }

    fn getxattr(
        &self,
        _ctx: &Context,
        inode: u64,
        name: &CStr,
        size: u32,
    ) -> io::Result<GetxattrReply> {
        if inode == ROOT_INO {
            return Err(enodata());
        }
        let inode = self.get(inode)?;
        let fd = self.path_fd(&inode)?;
        let name = name.to_str().map_err(|_| einval())?;
        let value = xattr::get(fd.proc_path(), name)?.ok_or_else(enodata)?;
        if size == 0 {
            Ok(GetxattrReply::Count(value.len() as u32))
        } else if value.len() as u32 > size {
            Err(erange())
        } else {
            Ok(GetxattrReply::Value(value))
        }
    }

    fn listxattr(&self, _ctx: &Context, inode: u64, size: u32) -> io::Result<ListxattrReply> {
        if inode == ROOT_INO {
            return if size == 0 {
                Ok(ListxattrReply::Count(0))
            } else {
                Ok(ListxattrReply::Names(Vec::new()))
            };
        }
        let inode = self.get(inode)?;
        let fd = self.path_fd(&inode)?;
        let mut names = Vec::new();
        for attr in xattr::list(fd.proc_path())? {
            names.extend_from_slice(attr.as_bytes());
            names.push(0);
        }
        if size == 0 {
            Ok(ListxattrReply::Count(names.len() as u32))
        } else if names.len() as u32 > size {
            Err(erange())
        } else {
            Ok(ListxattrReply::Names(names))
        }
    }

    fn access(&self, _ctx: &Context, inode: u64, mask: u32) -> io::Result<()> {
        if mask as i32 & libc::W_OK != 0 {
            return Err(eacces());
        }
        if inode == ROOT_INO {
            return Ok(());
        }
        let inode = self.get(inode)?;
        let fd = self.path_fd(&inode)?;
        let mut flags = AccessFlags::empty();
        if mask as i32 & libc::R_OK != 0 {
            flags |= AccessFlags::R_OK;
        }
        if mask as i32 & libc::X_OK != 0 {
            flags |= AccessFlags::X_OK;
        }
        access(fd.proc_path().as_str(), flags).map_err(nix_to_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use std::path::Path;

    use nix::fcntl::open;

    const LS_BYTES: &str = "the real ls\n";
    const TRAMPOLINE_BYTES: &str = "#!/bin/sh\nexec trampoline\n";

    fn write_file(path: &Path, contents: &str, mode: u32) {
        fs::write(path, contents).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(mode);
        fs::set_permissions(path, perms).unwrap();
    }

    struct Fixture {
        fs: EnvFs,
        _root: tempfile::TempDir,
        _host: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("bin")).unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        write_file(&root.path().join("bin/ls"), LS_BYTES, 0o755);
        write_file(&root.path().join("bin/cat"), "the real cat\n", 0o755);
        write_file(&root.path().join("etc/motd"), "welcome\n", 0o644);
        symlink("etc/motd", root.path().join("liberty")).unwrap();

        let host = tempfile::tempdir().unwrap();
        let trampoline = host.path().join("run");
        write_file(&trampoline, TRAMPOLINE_BYTES, 0o755);

        let fd = open(
            root.path(),
            OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .unwrap();
        let source = fd;
        Fixture {
            fs: EnvFs::new(source, trampoline),
            _root: root,
            _host: host,
        }
    }

    fn lookup(envfs: &EnvFs, parent: u64, name: &str) -> io::Result<Entry> {
        let name = CString::new(name).unwrap();
        envfs.lookup(&Context::new(), parent, &name)
    }

    fn read_names(envfs: &EnvFs, ino: u64) -> Vec<String> {
        let ctx = Context::new();
        let (handle, _) = envfs.opendir(&ctx, ino, 0).unwrap();
        let handle = handle.unwrap();
        let mut names = Vec::new();
        envfs
            .readdir(&ctx, ino, handle, 4096, 0, &mut |entry| {
                names.push(String::from_utf8(entry.name.to_vec()).unwrap());
                Ok(1)
            })
            .unwrap();
        envfs.releasedir(&ctx, ino, 0, handle).unwrap();
        names.sort();
        names
    }

    #[test]
    fn root_exposes_exactly_two_views() {
        let fx = fixture();
        let exe = lookup(&fx.fs, ROOT_INO, "exe").unwrap();
        let raw = lookup(&fx.fs, ROOT_INO, "raw").unwrap();
        assert_ne!(exe.inode, raw.inode);
        assert_eq!(exe.attr.st_mode & libc::S_IFMT, libc::S_IFDIR);
        assert_eq!(exe.attr.st_mode & 0o222, 0);

        let err = lookup(&fx.fs, ROOT_INO, "bogus").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn missing_entries_report_enoent() {
        let fx = fixture();
        let raw = lookup(&fx.fs, ROOT_INO, "raw").unwrap();
        let err = lookup(&fx.fs, raw.inode, "nope").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn exe_view_rewrites_executables_to_the_trampoline() {
        let fx = fixture();
        let exe = lookup(&fx.fs, ROOT_INO, "exe").unwrap();
        let bin = lookup(&fx.fs, exe.inode, "bin").unwrap();
        let ls = lookup(&fx.fs, bin.inode, "ls").unwrap();
        let cat = lookup(&fx.fs, bin.inode, "cat").unwrap();

        assert_eq!(ls.attr.st_size as usize, TRAMPOLINE_BYTES.len());
        assert_eq!(cat.attr.st_size as usize, TRAMPOLINE_BYTES.len());
        assert_eq!(ls.attr.st_mode & 0o222, 0);
        // distinct paths stay distinct inodes even though both rewrite
        assert_ne!(ls.inode, cat.inode);
    }

    #[test]
    fn raw_view_passes_attributes_through() {
        let fx = fixture();
        let raw = lookup(&fx.fs, ROOT_INO, "raw").unwrap();
        let bin = lookup(&fx.fs, raw.inode, "bin").unwrap();
        let ls = lookup(&fx.fs, bin.inode, "ls").unwrap();
        assert_eq!(ls.attr.st_size as usize, LS_BYTES.len());
        assert_eq!(ls.attr.st_mode & 0o222, 0);
    }

    #[test]
    fn non_executables_are_never_rewritten() {
        let fx = fixture();
        let exe = lookup(&fx.fs, ROOT_INO, "exe").unwrap();
        let etc = lookup(&fx.fs, exe.inode, "etc").unwrap();
        let motd = lookup(&fx.fs, etc.inode, "motd").unwrap();
        assert_eq!(motd.attr.st_size as usize, "welcome\n".len());
    }

    #[test]
    fn opening_an_exe_view_executable_yields_trampoline_bytes() {
        let fx = fixture();
        let exe = lookup(&fx.fs, ROOT_INO, "exe").unwrap();
        let bin = lookup(&fx.fs, exe.inode, "bin").unwrap();
        let ls = lookup(&fx.fs, bin.inode, "ls").unwrap();

        let inode = fx.fs.inodes.get(ls.inode).unwrap();
        let mut contents = String::new();
        fx.fs
            .open_inode(&inode)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, TRAMPOLINE_BYTES);
    }

    #[test]
    fn opening_a_raw_view_executable_yields_real_bytes() {
        let fx = fixture();
        let raw = lookup(&fx.fs, ROOT_INO, "raw").unwrap();
        let bin = lookup(&fx.fs, raw.inode, "bin").unwrap();
        let ls = lookup(&fx.fs, bin.inode, "ls").unwrap();

        let inode = fx.fs.inodes.get(ls.inode).unwrap();
        let mut contents = String::new();
        fx.fs
            .open_inode(&inode)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, LS_BYTES);
    }

    #[test]
    fn open_refuses_write_intent_and_directories() {
        let fx = fixture();
        let ctx = Context::new();
        let raw = lookup(&fx.fs, ROOT_INO, "raw").unwrap();
        let etc = lookup(&fx.fs, raw.inode, "etc").unwrap();
        let motd = lookup(&fx.fs, etc.inode, "motd").unwrap();

        let err = fx
            .fs
            .open(&ctx, motd.inode, libc::O_WRONLY as u32, 0)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
        let err = fx
            .fs
            .open(&ctx, motd.inode, (libc::O_RDONLY | libc::O_TRUNC) as u32, 0)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));

        let err = fx
            .fs
            .open(&ctx, ROOT_INO, libc::O_RDONLY as u32, 0)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EISDIR));

        let (handle, _, _) = fx
            .fs
            .open(&ctx, motd.inode, libc::O_RDONLY as u32, 0)
            .unwrap();
        fx.fs
            .release(&ctx, motd.inode, 0, handle.unwrap(), false, false, None)
            .unwrap();
        assert!(fx.fs.files.lock().unwrap().is_empty());
    }

    #[test]
    fn views_list_identical_names() {
        let fx = fixture();
        let exe = lookup(&fx.fs, ROOT_INO, "exe").unwrap();
        let raw = lookup(&fx.fs, ROOT_INO, "raw").unwrap();
        let exe_names = read_names(&fx.fs, exe.inode);
        assert_eq!(exe_names, read_names(&fx.fs, raw.inode));
        assert!(exe_names.contains(&"bin".to_string()));
        assert!(exe_names.contains(&"liberty".to_string()));
    }

    #[test]
    fn root_listing_is_synthesized() {
        let fx = fixture();
        let ctx = Context::new();
        let (handle, _) = fx.fs.opendir(&ctx, ROOT_INO, 0).unwrap();
        let handle = handle.unwrap();

        let mut entries: Vec<(u64, String)> = Vec::new();
        fx.fs
            .readdir(&ctx, ROOT_INO, handle, 4096, 0, &mut |entry| {
                entries.push((entry.ino, String::from_utf8(entry.name.to_vec()).unwrap()));
                Ok(1)
            })
            .unwrap();
        assert_eq!(
            entries,
            vec![
                (1, ".".to_string()),
                (2, "..".to_string()),
                (3, "exe".to_string()),
                (4, "raw".to_string()),
            ]
        );

        // resuming mid-listing replays only the tail
        let mut tail: Vec<String> = Vec::new();
        fx.fs
            .readdir(&ctx, ROOT_INO, handle, 4096, 2, &mut |entry| {
                tail.push(String::from_utf8(entry.name.to_vec()).unwrap());
                Ok(1)
            })
            .unwrap();
        assert_eq!(tail, vec!["exe".to_string(), "raw".to_string()]);

        fx.fs.releasedir(&ctx, ROOT_INO, 0, handle).unwrap();
    }

    #[test]
    fn readlink_returns_target_bytes() {
        let fx = fixture();
        let ctx = Context::new();
        let raw = lookup(&fx.fs, ROOT_INO, "raw").unwrap();
        let link = lookup(&fx.fs, raw.inode, "liberty").unwrap();
        assert_eq!(fx.fs.readlink(&ctx, link.inode).unwrap(), b"etc/motd");

        let err = fx.fs.readlink(&ctx, ROOT_INO).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        let err = fx.fs.readlink(&ctx, raw.inode).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn root_attributes_are_synthesized() {
        let fx = fixture();
        let ctx = Context::new();
        let (st, _) = fx.fs.getattr(&ctx, ROOT_INO, None).unwrap();
        assert_eq!(st.st_ino, ROOT_INO);
        assert_eq!(st.st_mode, libc::S_IFDIR | 0o555);
        assert_eq!(st.st_nlink, 4);
        assert_eq!(st.st_uid, ctx.uid);
        assert_eq!(st.st_gid, ctx.gid);
    }

    #[test]
    fn access_refuses_write_and_allows_read() {
        let fx = fixture();
        let ctx = Context::new();
        let raw = lookup(&fx.fs, ROOT_INO, "raw").unwrap();
        let etc = lookup(&fx.fs, raw.inode, "etc").unwrap();
        let motd = lookup(&fx.fs, etc.inode, "motd").unwrap();

        assert!(fx.fs.access(&ctx, motd.inode, libc::R_OK as u32).is_ok());
        let err = fx
            .fs
            .access(&ctx, motd.inode, libc::W_OK as u32)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));

        assert!(fx.fs.access(&ctx, ROOT_INO, libc::R_OK as u32).is_ok());
        let err = fx
            .fs
            .access(&ctx, ROOT_INO, (libc::R_OK | libc::W_OK) as u32)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    }

    #[test]
    fn forget_releases_interned_inodes() {
        let fx = fixture();
        let ctx = Context::new();
        let raw = lookup(&fx.fs, ROOT_INO, "raw").unwrap();
        let first = lookup(&fx.fs, raw.inode, "etc").unwrap();
        let second = lookup(&fx.fs, raw.inode, "etc").unwrap();
        assert_eq!(first.inode, second.inode);

        fx.fs.forget(&ctx, first.inode, 2);
        assert!(fx.fs.inodes.get(first.inode).is_none());
    }

    #[test]
    fn xattr_queries_on_root_are_empty() {
        let fx = fixture();
        let ctx = Context::new();
        let name = CString::new("user.test").unwrap();
        let err = match fx.fs.getxattr(&ctx, ROOT_INO, &name, 0) {
            Ok(_) => panic!("expected getxattr to fail"),
            Err(e) => e,
        };
        assert_eq!(err.raw_os_error(), Some(libc::ENODATA));
        match fx.fs.listxattr(&ctx, ROOT_INO, 0).unwrap() {
            ListxattrReply::Count(count) => assert_eq!(count, 0),
            ListxattrReply::Names(_) => panic!("expected a count"),
        }
    }
}
