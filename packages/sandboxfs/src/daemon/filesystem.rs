//! `fuser::Filesystem` implementation: the VFS dispatch surface that applies
//! the per-job visibility/mutability policy (spec.md §4.1.2–§4.1.5) to
//! every kernel callback.

use std::{
    ffi::{CString, OsStr},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd},
        unix::ffi::OsStrExt,
    },
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use nix::{
    dir::Dir,
    fcntl::{AtFlags, OFlag, openat},
    sys::stat::{Mode, fstatat, mkdirat},
    unistd::{Gid, Uid, fstatvfs, unlinkat, UnlinkatFlags},
};
use tracing::{instrument, warn};

use crate::{
    classify::PathClass,
    job::Job,
    path::ROOT,
};

use super::{DaemonContext, ROOT_INO};

const TTL: Duration = Duration::from_secs(1);

/// Convert a `nix::Error` into the raw errno `fuser` reply types expect.
fn errno(err: nix::Error) -> i32 {
    err as i32
}

fn system_time(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::new(sec.unsigned_abs(), 0)
    }
}

fn file_type_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn attr_from_stat(ino: u64, st: &libc::stat) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_type_from_mode(st.st_mode as u32),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn pseudo_attr(ino: u64, size: u64, kind: FileType, perm: u16) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind,
        perm,
        nlink: 1,
        uid: Uid::effective().as_raw(),
        gid: Gid::effective().as_raw(),
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

/// The daemon's `fuser::Filesystem` implementation.
pub struct DaemonFs {
    pub ctx: DaemonContext,
}

impl DaemonFs {
    pub fn new(ctx: DaemonContext) -> Self {
        Self { ctx }
    }

    fn child_path(&self, parent_ino: u64, name: &OsStr) -> Option<String> {
        let parent = self.ctx.path_for_ino(parent_ino)?;
        let name = name.to_str()?;
        Some(if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        })
    }

    fn dir_attr(&self, ino: u64) -> FileAttr {
        pseudo_attr(ino, 0, FileType::Directory, 0o755)
    }

    /// Resolve the `FileAttr` for a mount-relative path, applying the
    /// visibility policy for job-relative paths (spec.md §4.1.3 rule 1).
    fn attr_for_path(&mut self, path: &str) -> Result<FileAttr, i32> {
        let class = classify(path, &self.ctx.daemon_name.clone());
        match class {
            PathClass::Root => Ok(self.dir_attr(ROOT_INO)),
            PathClass::DaemonMarker => {
                let ino = self.ctx.ino_for_path(path);
                Ok(pseudo_attr(ino, 0, FileType::RegularFile, 0o444))
            }
            PathClass::JobInput(key) => {
                let len = self
                    .ctx
                    .jobs
                    .get(&key)
                    .map(|j| j.input_bytes().len() as u64)
                    .ok_or(libc::ENOENT)?;
                let ino = self.ctx.ino_for_path(path);
                Ok(pseudo_attr(ino, len, FileType::RegularFile, 0o600))
            }
            PathClass::JobOutput(key) => {
                let job = self.ctx.jobs.get(&key).ok_or(libc::ENOENT)?;
                if !job.output_ready() {
                    return Err(libc::ENOENT);
                }
                let len = job.output_bytes().len() as u64;
                let ino = self.ctx.ino_for_path(path);
                Ok(pseudo_attr(ino, len, FileType::RegularFile, 0o400))
            }
            PathClass::JobLive(key) => {
                if !self.ctx.jobs.contains_key(&key) {
                    return Err(libc::ENOENT);
                }
                let ino = self.ctx.ino_for_path(path);
                Ok(pseudo_attr(ino, 0, FileType::RegularFile, 0o600))
            }
            PathClass::JobPath(key, rel) => {
                let job = self.ctx.jobs.get(&key).ok_or(libc::ENOENT)?;
                if rel == ROOT {
                    let ino = self.ctx.ino_for_path(path);
                    return Ok(self.dir_attr(ino));
                }
                if !job.is_readable(&rel) {
                    return Err(libc::ENOENT);
                }
                let st = fstatat(
                    self.ctx.rootfd.as_fd(),
                    rel.as_str(),
                    AtFlags::AT_SYMLINK_NOFOLLOW,
                )
                .map_err(errno)?;
                let ino = self.ctx.ino_for_path(path);
                Ok(attr_from_stat(ino, &st))
            }
        }
    }
}

use crate::classify::classify;

impl Filesystem for DaemonFs {
    #[instrument(skip(self, _req, reply))]
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_for_path(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_for_path(&path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match classify(&path, &self.ctx.daemon_name.clone()) {
            PathClass::JobPath(key, rel) if rel != ROOT => {
                let Some(job) = self.ctx.jobs.get_mut(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                let wants_write = mask & libc::W_OK != 0;
                if wants_write {
                    if job.is_writable(&rel) {
                        reply.ok();
                    } else if job.is_readable(&rel) {
                        reply.error(libc::EACCES);
                    } else {
                        reply.error(libc::ENOENT);
                    }
                } else if job.is_readable(&rel) {
                    job.record_read(&rel);
                    reply.ok();
                } else {
                    reply.error(libc::ENOENT);
                }
            }
            _ => reply.ok(),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let PathClass::JobPath(key, rel) = classify(&path, &self.ctx.daemon_name.clone()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(job) = self.ctx.jobs.get_mut(&key) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !job.is_readable(&rel) {
            reply.error(libc::ENOENT);
            return;
        }
        match nix::fcntl::readlinkat(self.ctx.rootfd.as_fd(), rel.as_str()) {
            Ok(target) => {
                job.record_read(&rel);
                reply.data(target.as_os_str().as_encoded_bytes());
            }
            Err(err) => reply.error(errno(err)),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut entries: Vec<(String, FileType)> = vec![
            (".".to_string(), FileType::Directory),
            ("..".to_string(), FileType::Directory),
        ];

        match classify(&path, &self.ctx.daemon_name.clone()) {
            PathClass::Root => {
                entries.push((format!(".f.{}", self.ctx.daemon_name), FileType::RegularFile));
                for (key, job) in self.ctx.jobs.iter() {
                    entries.push((key.clone(), FileType::Directory));
                    entries.push((format!(".l.{key}"), FileType::RegularFile));
                    entries.push((format!(".i.{key}"), FileType::RegularFile));
                    if job.output_ready() {
                        entries.push((format!(".o.{key}"), FileType::RegularFile));
                    }
                }
            }
            PathClass::JobPath(key, rel) => {
                let Some(job) = self.ctx.jobs.get_mut(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                if rel != ROOT && !job.is_readable(&rel) {
                    reply.error(libc::ENOENT);
                    return;
                }
                let dir_path = if rel == ROOT { String::new() } else { rel.clone() };
                match list_workspace_dir(self.ctx.rootfd.as_fd(), &dir_path) {
                    Ok(children) => {
                        for name in children {
                            let full = if rel == ROOT {
                                name.clone()
                            } else {
                                format!("{rel}/{name}")
                            };
                            if job.is_readable(&full) {
                                entries.push((name, FileType::RegularFile));
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%err, "readdir: underlying directory listing failed");
                    }
                }
            }
            _ => {
                reply.error(libc::ENOTDIR);
                return;
            }
        }

        for (i, (name, kind)) in entries.into_iter().enumerate().skip(offset as usize) {
            let next_offset = (i + 1) as i64;
            let ino = self.ctx.ino_for_path(&name);
            if reply.add(ino, next_offset, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    #[instrument(skip(self, _req, reply))]
    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match fstatvfs(self.ctx.rootfd.as_fd()) {
            Ok(stat) => reply.statfs(
                stat.blocks(),
                stat.blocks_free(),
                stat.blocks_available(),
                stat.files(),
                stat.files_free(),
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(err) => reply.error(errno(err)),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match classify(&path, &self.ctx.daemon_name.clone()) {
            PathClass::DaemonMarker => {
                self.ctx.global_refs += 1;
                self.ctx.note_activity();
                reply.opened(ino, 0);
            }
            PathClass::JobInput(key) => {
                let Some(job) = self.ctx.jobs.get_mut(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                job.bump_input();
                reply.opened(ino, 0);
            }
            PathClass::JobOutput(key) => {
                let Some(job) = self.ctx.jobs.get(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                if !job.output_ready() {
                    reply.error(libc::ENOENT);
                    return;
                }
                self.ctx.jobs.get_mut(&key).unwrap().bump_output();
                reply.opened(ino, 0);
            }
            PathClass::JobLive(key) => {
                let is_new = !self.ctx.jobs.contains_key(&key);
                if is_new && self.ctx.shutdown_armed {
                    // spec.md §4.1.4: a create during an in-progress
                    // shutdown is refused so the client restarts a
                    // successor daemon.
                    reply.error(libc::ENODEV);
                    return;
                }
                let job = self.ctx.jobs.entry(key).or_insert_with(Job::new);
                job.bump_live();
                self.ctx.note_activity();
                reply.opened(ino, 0);
            }
            PathClass::JobPath(key, rel) if rel != ROOT => {
                let Some(job) = self.ctx.jobs.get_mut(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                let want_write = flags & libc::O_ACCMODE != libc::O_RDONLY;
                let ok = if want_write {
                    job.is_writable(&rel)
                } else {
                    job.is_readable(&rel)
                };
                if !ok {
                    let code = if job.is_readable(&rel) {
                        libc::EACCES
                    } else {
                        libc::ENOENT
                    };
                    reply.error(code);
                    return;
                }
                if !want_write {
                    job.record_read(&rel);
                }
                let oflags = OFlag::from_bits_truncate(flags);
                match openat(self.ctx.rootfd.as_fd(), rel.as_str(), oflags, Mode::empty()) {
                    Ok(fd) => {
                        let fh = fd.as_raw_fd() as u64;
                        std::mem::forget(fd); // ownership transferred to the fh table below
                        self.register_fh(fh);
                        reply.opened(fh, 0);
                    }
                    Err(err) => reply.error(errno(err)),
                }
            }
            _ => reply.error(libc::EISDIR),
        }
    }

    #[instrument(skip(self, _req, reply, data), fields(len = data.len()))]
    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match classify(&path, &self.ctx.daemon_name.clone()) {
            PathClass::JobOutput(_) => reply.error(libc::EACCES),
            PathClass::JobInput(key) => {
                let Some(job) = self.ctx.jobs.get_mut(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                let written = job.append_input(data);
                reply.written(written as u32);
            }
            PathClass::JobLive(key) => {
                let Some(job) = self.ctx.jobs.get_mut(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                // Deliberately failing: the write's side effect is
                // finalizing the output report (spec.md §4.1.1, §4.1.7).
                job.finalize_output();
                reply.error(libc::ENOSPC);
            }
            PathClass::JobPath(key, rel) if rel != ROOT => {
                let Some(job) = self.ctx.jobs.get_mut(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                if !job.is_writable(&rel) {
                    let code = if job.is_readable(&rel) {
                        libc::EACCES
                    } else {
                        libc::ENOENT
                    };
                    reply.error(code);
                    return;
                }
                let fd = unsafe { BorrowedFd::borrow_raw(fh as i32) };
                match nix::sys::uio::pwrite(fd, data, offset) {
                    Ok(n) => {
                        job.add_obytes(n as u64);
                        reply.written(n as u32);
                    }
                    Err(err) => reply.error(errno(err)),
                }
            }
            _ => reply.error(libc::EBADF),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match classify(&path, &self.ctx.daemon_name.clone()) {
            PathClass::DaemonMarker | PathClass::JobLive(_) => reply.data(&[]),
            PathClass::JobInput(key) => {
                let Some(job) = self.ctx.jobs.get(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                reply.data(slice_at(job.input_bytes(), offset, size));
            }
            PathClass::JobOutput(key) => {
                let Some(job) = self.ctx.jobs.get(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                reply.data(slice_at(&job.output_bytes(), offset, size));
            }
            PathClass::JobPath(key, rel) if rel != ROOT => {
                let Some(job) = self.ctx.jobs.get_mut(&key) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                if !job.is_readable(&rel) {
                    reply.error(libc::ENOENT);
                    return;
                }
                let fd = unsafe { BorrowedFd::borrow_raw(fh as i32) };
                let mut buf = vec![0u8; size as usize];
                match nix::sys::uio::pread(fd, &mut buf, offset) {
                    Ok(n) => {
                        buf.truncate(n);
                        job.add_ibytes(n as u64);
                        reply.data(&buf);
                    }
                    Err(err) => reply.error(errno(err)),
                }
            }
            _ => reply.error(libc::EBADF),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.ok();
            return;
        };
        match classify(&path, &self.ctx.daemon_name.clone()) {
            PathClass::DaemonMarker => {
                self.ctx.global_refs = self.ctx.global_refs.saturating_sub(1);
                self.ctx.note_activity();
            }
            PathClass::JobInput(key) => {
                if let Some(job) = self.ctx.jobs.get_mut(&key) {
                    if job.release_input() == 0 {
                        job.apply_visible_manifest();
                    }
                }
                self.ctx.reap_job_if_unreferenced(&key);
            }
            PathClass::JobOutput(key) => {
                if let Some(job) = self.ctx.jobs.get_mut(&key) {
                    job.release_output();
                }
                self.ctx.reap_job_if_unreferenced(&key);
            }
            PathClass::JobLive(key) => {
                if let Some(job) = self.ctx.jobs.get_mut(&key) {
                    job.release_live();
                }
                self.ctx.reap_job_if_unreferenced(&key);
            }
            PathClass::JobPath(_, rel) if rel != ROOT => {
                self.release_fh(fh);
            }
            _ => {}
        }
        reply.ok();
    }

    #[instrument(skip(self, _req, reply))]
    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.ok();
            return;
        };
        match classify(&path, &self.ctx.daemon_name.clone()) {
            PathClass::JobPath(_, rel) if rel != ROOT => {
                let fd = unsafe { BorrowedFd::borrow_raw(fh as i32) };
                match nix::unistd::fsync(fd.as_raw_fd()) {
                    Ok(()) => reply.ok(),
                    Err(err) => reply.error(errno(err)),
                }
            }
            // Writing the liveness handle is already required to fail
            // (ENOSPC); an fsync against it is harmless to acknowledge.
            _ => reply.ok(),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn fallocate(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let PathClass::JobPath(key, rel) = classify(&path, &self.ctx.daemon_name.clone()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(job) = self.ctx.jobs.get(&key) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !job.is_writable(&rel) {
            let code = if job.is_readable(&rel) { libc::EACCES } else { libc::ENOENT };
            reply.error(code);
            return;
        }
        let ret = unsafe { libc::posix_fallocate(fh as i32, offset, length) };
        if ret == 0 {
            reply.ok();
        } else {
            reply.error(ret);
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let PathClass::JobPath(key, rel) = classify(&path, &self.ctx.daemon_name.clone()) else {
            reply.error(libc::EACCES);
            return;
        };
        let Some(job) = self.ctx.jobs.get_mut(&key) else {
            reply.error(libc::ENOENT);
            return;
        };
        if job.is_create_conflict(&rel) {
            reply.error(libc::EEXIST);
            return;
        }
        if !job.is_writable(&rel) {
            reclaim_for_create(self.ctx.rootfd.as_fd(), &rel);
        }
        let oflags = OFlag::from_bits_truncate(flags) | OFlag::O_CREAT;
        match openat(
            self.ctx.rootfd.as_fd(),
            rel.as_str(),
            oflags,
            Mode::from_bits_truncate(mode),
        ) {
            Ok(fd) => {
                job.record_write(&rel);
                let fh = fd.as_raw_fd() as u64;
                std::mem::forget(fd);
                self.register_fh(fh);
                match fstatat(self.ctx.rootfd.as_fd(), rel.as_str(), AtFlags::empty()) {
                    Ok(st) => {
                        let ino = self.ctx.ino_for_path(&path);
                        reply.created(&TTL, &attr_from_stat(ino, &st), 0, fh, 0);
                    }
                    Err(err) => reply.error(errno(err)),
                }
            }
            Err(err) => reply.error(errno(err)),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let PathClass::JobPath(key, rel) = classify(&path, &self.ctx.daemon_name.clone()) else {
            reply.error(libc::EACCES);
            return;
        };
        let Some(job) = self.ctx.jobs.get_mut(&key) else {
            reply.error(libc::ENOENT);
            return;
        };
        if job.is_create_conflict(&rel) {
            reply.error(libc::EEXIST);
            return;
        }
        if !job.is_writable(&rel) {
            reclaim_for_create(self.ctx.rootfd.as_fd(), &rel);
        }
        match mkdirat(
            self.ctx.rootfd.as_fd(),
            rel.as_str(),
            Mode::from_bits_truncate(mode),
        ) {
            Ok(()) => {
                job.record_write(&rel);
                match fstatat(self.ctx.rootfd.as_fd(), rel.as_str(), AtFlags::empty()) {
                    Ok(st) => {
                        let ino = self.ctx.ino_for_path(&path);
                        reply.entry(&TTL, &attr_from_stat(ino, &st), 0);
                    }
                    Err(err) => reply.error(errno(err)),
                }
            }
            Err(err) => reply.error(errno(err)),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove(parent, name, UnlinkatFlags::NoRemoveDir, reply);
    }

    #[instrument(skip(self, _req, reply))]
    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove(parent, name, UnlinkatFlags::RemoveDir, reply);
    }

    #[instrument(skip(self, _req, reply))]
    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let PathClass::JobPath(key, rel) = classify(&path, &self.ctx.daemon_name.clone()) else {
            reply.error(libc::EACCES);
            return;
        };
        let Some(job) = self.ctx.jobs.get_mut(&key) else {
            reply.error(libc::ENOENT);
            return;
        };
        if job.is_create_conflict(&rel) {
            reply.error(libc::EEXIST);
            return;
        }
        if !job.is_writable(&rel) {
            reclaim_for_create(self.ctx.rootfd.as_fd(), &rel);
        }
        match nix::unistd::symlinkat(target, Some(self.ctx.rootfd.as_raw_fd()), rel.as_str()) {
            Ok(()) => {
                job.record_write(&rel);
                match fstatat(self.ctx.rootfd.as_fd(), rel.as_str(), AtFlags::AT_SYMLINK_NOFOLLOW) {
                    Ok(st) => {
                        let ino = self.ctx.ino_for_path(&path);
                        reply.entry(&TTL, &attr_from_stat(ino, &st), 0);
                    }
                    Err(err) => reply.error(errno(err)),
                }
            }
            Err(err) => reply.error(errno(err)),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn link(&mut self, _req: &Request, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let (Some(src_path), Some(dst_path)) =
            (self.ctx.path_for_ino(ino).map(str::to_string), self.child_path(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let (PathClass::JobPath(src_key, src_rel), PathClass::JobPath(dst_key, dst_rel)) = (
            classify(&src_path, &self.ctx.daemon_name.clone()),
            classify(&dst_path, &self.ctx.daemon_name.clone()),
        ) else {
            reply.error(libc::EACCES);
            return;
        };
        if src_key != dst_key {
            // Cross-job hardlink (spec.md §4.1.3 rule 4).
            reply.error(libc::EXDEV);
            return;
        }
        let Some(job) = self.ctx.jobs.get_mut(&src_key) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !job.is_readable(&src_rel) {
            reply.error(libc::ENOENT);
            return;
        }
        if job.is_create_conflict(&dst_rel) {
            reply.error(libc::EEXIST);
            return;
        }
        if !job.is_writable(&dst_rel) {
            reclaim_for_create(self.ctx.rootfd.as_fd(), &dst_rel);
        }
        match nix::unistd::linkat(
            Some(self.ctx.rootfd.as_raw_fd()),
            src_rel.as_str(),
            Some(self.ctx.rootfd.as_raw_fd()),
            dst_rel.as_str(),
            nix::unistd::LinkatFlags::NoSymlinkFollow,
        ) {
            Ok(()) => {
                job.record_write(&dst_rel);
                match fstatat(self.ctx.rootfd.as_fd(), dst_rel.as_str(), AtFlags::empty()) {
                    Ok(st) => {
                        let ino = self.ctx.ino_for_path(&dst_path);
                        reply.entry(&TTL, &attr_from_stat(ino, &st), 0);
                    }
                    Err(err) => reply.error(errno(err)),
                }
            }
            Err(err) => reply.error(errno(err)),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(src_path), Some(dst_path)) =
            (self.child_path(parent, name), self.child_path(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let (PathClass::JobPath(src_key, src_rel), PathClass::JobPath(dst_key, dst_rel)) = (
            classify(&src_path, &self.ctx.daemon_name.clone()),
            classify(&dst_path, &self.ctx.daemon_name.clone()),
        ) else {
            reply.error(libc::EACCES);
            return;
        };
        if src_key != dst_key {
            // Cross-job rename leaves both jobs unmodified (spec.md §4.1.3
            // rule 4, testable property 5).
            reply.error(libc::EXDEV);
            return;
        }
        let Some(job) = self.ctx.jobs.get_mut(&src_key) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !job.is_readable(&src_rel) {
            reply.error(libc::ENOENT);
            return;
        }
        if job.is_create_conflict(&dst_rel) {
            reply.error(libc::EEXIST);
            return;
        }
        if !job.is_writable(&dst_rel) {
            reclaim_for_create(self.ctx.rootfd.as_fd(), &dst_rel);
        }
        match nix::fcntl::renameat(
            Some(self.ctx.rootfd.as_raw_fd()),
            src_rel.as_str(),
            Some(self.ctx.rootfd.as_raw_fd()),
            dst_rel.as_str(),
        ) {
            Ok(()) => {
                job.rename_within(&src_rel, &dst_rel);
                job.record_write(&dst_rel);
                reply.ok();
            }
            Err(err) => reply.error(errno(err)),
        }
    }

    #[instrument(skip(self, _req, reply))]
    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.ctx.path_for_ino(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let PathClass::JobPath(key, rel) = classify(&path, &self.ctx.daemon_name.clone()) else {
            reply.error(libc::EACCES);
            return;
        };
        let Some(job) = self.ctx.jobs.get_mut(&key) else {
            reply.error(libc::ENOENT);
            return;
        };
        if rel != ROOT {
            // chmod, chown, truncate, utimens: mutations on existing state
            // (spec.md §4.1.3 rule 2).
            if !job.is_writable(&rel) {
                let code = if job.is_readable(&rel) { libc::EACCES } else { libc::ENOENT };
                reply.error(code);
                return;
            }
            if let Some(mode) = mode {
                let _ = nix::sys::stat::fchmodat(
                    Some(self.ctx.rootfd.as_raw_fd()),
                    rel.as_str(),
                    Mode::from_bits_truncate(mode),
                    nix::sys::stat::FchmodatFlags::FollowSymlink,
                );
            }
            if uid.is_some() || gid.is_some() {
                let _ = nix::unistd::fchownat(
                    Some(self.ctx.rootfd.as_raw_fd()),
                    rel.as_str(),
                    uid.map(Uid::from_raw),
                    gid.map(Gid::from_raw),
                    nix::unistd::FchownatFlags::FollowSymlink,
                );
            }
            if let Some(size) = size {
                if let Some(fh) = fh {
                    let _ = nix::unistd::ftruncate(unsafe { BorrowedFd::borrow_raw(fh as i32) }, size as i64);
                } else if let Ok(fd) = openat(
                    self.ctx.rootfd.as_fd(),
                    rel.as_str(),
                    OFlag::O_WRONLY,
                    Mode::empty(),
                ) {
                    let _ = nix::unistd::ftruncate(fd.as_fd(), size as i64);
                }
            }
        }
        match self.attr_for_path(&path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let rel = match self.xattr_target(ino, Access::Read) {
            Ok(rel) => rel,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.read_xattr(&rel, name) {
            Ok(value) => xattr_reply(reply, size, &value),
            Err(err) => reply.error(errno(err)),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let rel = match self.xattr_target(ino, Access::Read) {
            Ok(rel) => rel,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.list_xattrs(&rel) {
            Ok(names) => xattr_reply(reply, size, &names),
            Err(err) => reply.error(errno(err)),
        }
    }

    #[instrument(skip(self, _req, reply, value), fields(len = value.len()))]
    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let rel = match self.xattr_target(ino, Access::Write) {
            Ok(rel) => rel,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.write_xattr(&rel, name, value) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(err)),
        }
    }

    #[instrument(skip(self, _req, reply))]
    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let rel = match self.xattr_target(ino, Access::Write) {
            Ok(rel) => rel,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.remove_xattr(&rel, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(err)),
        }
    }
}

/// Which of a job's read/write policies an xattr callback needs satisfied.
enum Access {
    Read,
    Write,
}

impl DaemonFs {
    /// Resolve `ino` to the workspace-relative path an xattr callback
    /// operates on, checking the same visibility/mutability policy as other
    /// mutating and non-mutating operations (spec.md §4.1.3). Pseudo-files
    /// and directories outside a job's path space don't support extended
    /// attributes (original-source supplement, scoped to real files only).
    fn xattr_target(&self, ino: u64, access: Access) -> Result<String, i32> {
        let path = self.ctx.path_for_ino(ino).ok_or(libc::ENOENT)?.to_string();
        let PathClass::JobPath(key, rel) = classify(&path, &self.ctx.daemon_name.clone()) else {
            return Err(libc::ENOSYS);
        };
        if rel == ROOT {
            return Err(libc::ENOSYS);
        }
        let job = self.ctx.jobs.get(&key).ok_or(libc::ENOENT)?;
        let allowed = match access {
            Access::Read => job.is_readable(&rel),
            Access::Write => job.is_writable(&rel),
        };
        if allowed {
            Ok(rel)
        } else if job.is_readable(&rel) {
            Err(libc::EACCES)
        } else {
            Err(libc::ENOENT)
        }
    }

    fn open_xattr_target(&self, rel: &str) -> nix::Result<std::os::fd::OwnedFd> {
        openat(self.ctx.rootfd.as_fd(), rel, OFlag::O_RDONLY, Mode::empty())
    }

    fn read_xattr(&self, rel: &str, name: &OsStr) -> nix::Result<Vec<u8>> {
        let fd = self.open_xattr_target(rel)?;
        let cname = os_str_to_cstring(name)?;
        let mut buf = vec![0u8; 4096];
        loop {
            let ret = unsafe {
                libc::fgetxattr(
                    fd.as_raw_fd(),
                    cname.as_ptr(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if ret >= 0 {
                buf.truncate(ret as usize);
                return Ok(buf);
            }
            let err = nix::Error::last();
            if err == nix::Error::ERANGE && buf.len() < 1 << 20 {
                buf.resize(buf.len() * 4, 0);
                continue;
            }
            return Err(err);
        }
    }

    fn list_xattrs(&self, rel: &str) -> nix::Result<Vec<u8>> {
        let fd = self.open_xattr_target(rel)?;
        let mut buf = vec![0u8; 4096];
        loop {
            let ret = unsafe { libc::flistxattr(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if ret >= 0 {
                buf.truncate(ret as usize);
                return Ok(buf);
            }
            let err = nix::Error::last();
            if err == nix::Error::ERANGE && buf.len() < 1 << 20 {
                buf.resize(buf.len() * 4, 0);
                continue;
            }
            return Err(err);
        }
    }

    fn write_xattr(&self, rel: &str, name: &OsStr, value: &[u8]) -> nix::Result<()> {
        let fd = self.open_xattr_target(rel)?;
        let cname = os_str_to_cstring(name)?;
        let ret = unsafe {
            libc::fsetxattr(
                fd.as_raw_fd(),
                cname.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(nix::Error::last())
        }
    }

    fn remove_xattr(&self, rel: &str, name: &OsStr) -> nix::Result<()> {
        let fd = self.open_xattr_target(rel)?;
        let cname = os_str_to_cstring(name)?;
        let ret = unsafe { libc::fremovexattr(fd.as_raw_fd(), cname.as_ptr()) };
        if ret == 0 {
            Ok(())
        } else {
            Err(nix::Error::last())
        }
    }

    fn register_fh(&mut self, _fh: u64) {
        // Real file descriptors are tracked implicitly by their own value
        // (the raw fd doubles as the `fh` handed to the kernel); nothing
        // further to record here beyond what `openat` already returned.
    }

    fn release_fh(&mut self, fh: u64) {
        let fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(fh as i32) };
        drop(fd);
    }

    fn remove(&mut self, parent: u64, name: &OsStr, flag: UnlinkatFlags, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let PathClass::JobPath(key, rel) = classify(&path, &self.ctx.daemon_name.clone()) else {
            reply.error(libc::EACCES);
            return;
        };
        let Some(job) = self.ctx.jobs.get_mut(&key) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !job.is_writable(&rel) {
            let code = if job.is_readable(&rel) { libc::EACCES } else { libc::ENOENT };
            reply.error(code);
            return;
        }
        match unlinkat(Some(self.ctx.rootfd.as_raw_fd()), rel.as_str(), flag) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(err)),
        }
    }
}

/// List the immediate children of `dir_path` (relative to the workspace
/// root), or `""` for the root itself.
fn list_workspace_dir(rootfd: BorrowedFd<'_>, dir_path: &str) -> nix::Result<Vec<String>> {
    let dir_fd = if dir_path.is_empty() {
        openat(rootfd, ".", OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())?
    } else {
        openat(rootfd, dir_path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())?
    };
    let mut dir = Dir::from_fd(dir_fd.into())?;
    let mut names = Vec::new();
    for entry in dir.iter() {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != "." && name != ".." {
            names.push(name);
        }
    }
    Ok(names)
}

/// Reclaim `rel` before a create-type operation claims it for the first
/// time (spec.md §4.1.3 rule 3): a path that is present on disk but
/// untracked by `J.wrote` is recursively unlinked rather than surfacing a
/// stale `EEXIST`/`ENOTEMPTY` from the raw syscall that follows. Silent if
/// nothing exists at `rel`; logs and proceeds if the stat or removal itself
/// fails, leaving the eventual create syscall to report the real error.
fn reclaim_for_create(rootfd: BorrowedFd<'_>, rel: &str) {
    let st = match fstatat(rootfd, rel, AtFlags::AT_SYMLINK_NOFOLLOW) {
        Ok(st) => st,
        Err(nix::Error::ENOENT) => return,
        Err(err) => {
            warn!(%err, rel, "stat before reclaiming untracked create target failed");
            return;
        }
    };
    if let Err(err) = remove_tree(rootfd, rel, &st) {
        warn!(%err, rel, "failed to reclaim untracked path before create");
    }
}

/// Remove the file, symlink, or directory tree at `rel`, whose `lstat` is
/// already known to be `st`.
fn remove_tree(rootfd: BorrowedFd<'_>, rel: &str, st: &libc::stat) -> nix::Result<()> {
    if st.st_mode as u32 & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
        for child in list_workspace_dir(rootfd, rel)? {
            let child_rel = format!("{rel}/{child}");
            let child_st = fstatat(rootfd, child_rel.as_str(), AtFlags::AT_SYMLINK_NOFOLLOW)?;
            remove_tree(rootfd, &child_rel, &child_st)?;
        }
        unlinkat(Some(rootfd.as_raw_fd()), rel, UnlinkatFlags::RemoveDir)
    } else {
        unlinkat(Some(rootfd.as_raw_fd()), rel, UnlinkatFlags::NoRemoveDir)
    }
}

fn os_str_to_cstring(name: &OsStr) -> nix::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| nix::Error::EINVAL)
}

/// Reply to a `getxattr`/`listxattr` callback per FUSE's size-probe
/// convention: `size == 0` means "tell me how big the value is", otherwise
/// return the value if it fits or `ERANGE` if the caller's buffer is too
/// small.
fn xattr_reply(reply: ReplyXattr, size: u32, value: &[u8]) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if value.len() > size as usize {
        reply.error(libc::ERANGE);
    } else {
        reply.data(value);
    }
}

fn slice_at(buf: &[u8], offset: i64, size: u32) -> &[u8] {
    let offset = offset.max(0) as usize;
    if offset >= buf.len() {
        return &[];
    }
    let end = (offset + size as usize).min(buf.len());
    &buf[offset..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_at_clamps_to_buffer_bounds() {
        let buf = b"0123456789";
        assert_eq!(slice_at(buf, 0, 4), b"0123");
        assert_eq!(slice_at(buf, 8, 10), b"89");
        assert_eq!(slice_at(buf, 20, 5), b"");
    }

    #[test]
    fn file_type_from_mode_maps_common_kinds() {
        assert_eq!(file_type_from_mode(libc::S_IFDIR as u32), FileType::Directory);
        assert_eq!(file_type_from_mode(libc::S_IFLNK as u32), FileType::Symlink);
        assert_eq!(file_type_from_mode(libc::S_IFREG as u32), FileType::RegularFile);
    }

    fn open_root(dir: &std::path::Path) -> nix::dir::Dir {
        nix::dir::Dir::open(dir, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()).expect("open root")
    }

    #[test]
    fn reclaim_for_create_removes_untracked_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("stale.txt"), b"leftover").expect("write stale file");
        let root = open_root(dir.path());

        reclaim_for_create(root.as_fd(), "stale.txt");

        assert!(!dir.path().join("stale.txt").exists());
    }

    #[test]
    fn reclaim_for_create_removes_untracked_directory_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("stale/nested")).expect("create stale tree");
        std::fs::write(dir.path().join("stale/nested/leaf.txt"), b"x").expect("write leaf");
        let root = open_root(dir.path());

        reclaim_for_create(root.as_fd(), "stale");

        assert!(!dir.path().join("stale").exists());
    }

    #[test]
    fn reclaim_for_create_is_a_no_op_when_nothing_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = open_root(dir.path());

        // Must not panic or error just because there's nothing to reclaim.
        reclaim_for_create(root.as_fd(), "never-existed");
    }
}
