//! Shared-memory audio ring between a client and the engine.
//!
//! The segment is a fixed header followed by a sample area holding
//! `used_size * 2` frames. `read_offset` and `write_offset` are free-running
//! frame counters; the byte position of an offset is
//! `(offset % used_size) * frame_bytes`, so a window that crosses the
//! `used_size` boundary is copied in two parts. The producer may advance at
//! most `used_size - level` frames and the consumer at most `level`, where
//! `level = write_offset - read_offset` (wrapping).
//!
//! Offsets are published with release stores and observed with acquire
//! loads: the producer's sample writes happen-before any consumer that saw
//! the bumped `write_offset`, and symmetrically for reads. Timestamps and
//! `callback_pending` are advisory and use relaxed ordering.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::time::{clock_gettime, ClockId};
use thiserror::Error;

/// Bytes reserved for the header at the start of the segment.
pub const SHM_HEADER_BYTES: usize = 64;

const OFF_USED_SIZE: usize = 0;
const OFF_FRAME_BYTES: usize = 4;
const OFF_READ_OFFSET: usize = 8;
const OFF_WRITE_OFFSET: usize = 12;
const OFF_WRITE_TS_SEC: usize = 16;
const OFF_WRITE_TS_NSEC: usize = 24;
const OFF_READ_TS_SEC: usize = 32;
const OFF_READ_TS_NSEC: usize = 40;
const OFF_CALLBACK_PENDING: usize = 48;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shm io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid ring geometry: {0}")]
    Geometry(&'static str),
    #[error("segment too small: {have} bytes, need {need}")]
    BadSegment { have: usize, need: usize },
}

impl From<nix::Error> for ShmError {
    fn from(err: nix::Error) -> ShmError {
        ShmError::Io(io::Error::from(err))
    }
}

/// One mapped audio shm segment. Both the server and the client hold one of
/// these over the same memfd; which side produces and which consumes is
/// decided by the stream direction.
pub struct AudioShm {
    map: MmapMut,
    file: File,
    used_size: u32,
    frame_bytes: u32,
}

// SAFETY: all cross-thread access to the mapping goes through atomics or
// through sample regions that the ring discipline hands to exactly one side
// at a time.
unsafe impl Send for AudioShm {}
unsafe impl Sync for AudioShm {}

impl AudioShm {
    /// Create a fresh segment on a memfd. `used_size` is the ring capacity in
    /// frames; it must be even and non-zero, and `frame_bytes` non-zero.
    pub fn create(used_size: u32, frame_bytes: u32) -> Result<AudioShm, ShmError> {
        if used_size == 0 || used_size % 2 != 0 {
            return Err(ShmError::Geometry("used_size must be even and non-zero"));
        }
        if frame_bytes == 0 {
            return Err(ShmError::Geometry("frame_bytes must be non-zero"));
        }
        let total = SHM_HEADER_BYTES + used_size as usize * 2 * frame_bytes as usize;

        let fd = memfd_create(
            c"concerto-audio-shm",
            MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
        )?;
        let file = File::from(fd);
        file.set_len(total as u64)?;
        // The far side maps the segment too; sealing shrink keeps a
        // misbehaving peer from truncating it under our mapping.
        // SAFETY: plain fcntl on a valid owned fd.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADD_SEALS, libc::F_SEAL_SHRINK) };
        if rc != 0 {
            return Err(ShmError::Io(io::Error::last_os_error()));
        }

        // SAFETY: the memfd is exclusively ours and sized above.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let shm = AudioShm {
            map,
            file,
            used_size,
            frame_bytes,
        };
        shm.header_u32(OFF_USED_SIZE).store(used_size, Ordering::Relaxed);
        shm.header_u32(OFF_FRAME_BYTES).store(frame_bytes, Ordering::Relaxed);
        shm.header_u32(OFF_READ_OFFSET).store(0, Ordering::Release);
        shm.header_u32(OFF_WRITE_OFFSET).store(0, Ordering::Release);
        shm.header_u32(OFF_CALLBACK_PENDING).store(0, Ordering::Relaxed);
        Ok(shm)
    }

    /// Map an existing segment received from the peer.
    pub fn from_fd(fd: OwnedFd) -> Result<AudioShm, ShmError> {
        // SAFETY: fd ownership was transferred to us by the peer.
        let file = unsafe { File::from_raw_fd(fd.into_raw_fd()) };
        // SAFETY: mapped read/write; the ring discipline partitions access.
        let map = unsafe { MmapMut::map_mut(&file)? };
        if map.len() < SHM_HEADER_BYTES {
            return Err(ShmError::BadSegment {
                have: map.len(),
                need: SHM_HEADER_BYTES,
            });
        }
        let shm = AudioShm {
            map,
            file,
            used_size: 0,
            frame_bytes: 0,
        };
        let used_size = shm.header_u32(OFF_USED_SIZE).load(Ordering::Relaxed);
        let frame_bytes = shm.header_u32(OFF_FRAME_BYTES).load(Ordering::Relaxed);
        if used_size == 0 || frame_bytes == 0 {
            return Err(ShmError::Geometry("unconfigured segment"));
        }
        let need = SHM_HEADER_BYTES + used_size as usize * 2 * frame_bytes as usize;
        if shm.map.len() < need {
            return Err(ShmError::BadSegment {
                have: shm.map.len(),
                need,
            });
        }
        Ok(AudioShm {
            used_size,
            frame_bytes,
            ..shm
        })
    }

    #[inline]
    pub fn used_size(&self) -> u32 {
        self.used_size
    }

    #[inline]
    pub fn frame_bytes(&self) -> u32 {
        self.frame_bytes
    }

    fn header_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + 4 <= SHM_HEADER_BYTES && offset % 4 == 0);
        // SAFETY: the mapping is page aligned, the offset is in the header
        // and 4-byte aligned, and atomics are valid over shared memory.
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn header_u64(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset + 8 <= SHM_HEADER_BYTES && offset % 8 == 0);
        // SAFETY: as header_u32, with 8-byte alignment.
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU64) }
    }

    #[inline]
    pub fn read_offset(&self) -> u32 {
        self.header_u32(OFF_READ_OFFSET).load(Ordering::Acquire)
    }

    #[inline]
    pub fn write_offset(&self) -> u32 {
        self.header_u32(OFF_WRITE_OFFSET).load(Ordering::Acquire)
    }

    /// Frames buffered and ready for the consumer.
    #[inline]
    pub fn level(&self) -> u32 {
        self.write_offset().wrapping_sub(self.read_offset()).min(self.used_size)
    }

    /// Frames of free space available to the producer.
    #[inline]
    pub fn writable_frames(&self) -> u32 {
        self.used_size - self.level()
    }

    /// Copy up to `dst.len() / frame_bytes` frames out of the ring without
    /// consuming them. Returns the number of frames copied.
    pub fn copy_out(&self, dst: &mut [u8]) -> u32 {
        let want = (dst.len() / self.frame_bytes as usize) as u32;
        let frames = want.min(self.level());
        if frames == 0 {
            return 0;
        }
        let (first, second) = self.split_range(self.read_offset(), frames);
        let fb = self.frame_bytes as usize;
        let first_bytes = first.1 as usize * fb;
        dst[..first_bytes].copy_from_slice(self.sample_slice(first.0, first.1));
        if second.1 > 0 {
            let second_bytes = second.1 as usize * fb;
            dst[first_bytes..first_bytes + second_bytes]
                .copy_from_slice(self.sample_slice(second.0, second.1));
        }
        frames
    }

    /// Copy whole frames from `src` into the ring without publishing them.
    /// Returns the number of frames copied (bounded by free space).
    pub fn copy_in(&self, src: &[u8]) -> u32 {
        let want = (src.len() / self.frame_bytes as usize) as u32;
        let frames = want.min(self.writable_frames());
        if frames == 0 {
            return 0;
        }
        let (first, second) = self.split_range(self.write_offset(), frames);
        let fb = self.frame_bytes as usize;
        let first_bytes = first.1 as usize * fb;
        self.sample_slice_mut(first.0, first.1)
            .copy_from_slice(&src[..first_bytes]);
        if second.1 > 0 {
            let second_bytes = second.1 as usize * fb;
            self.sample_slice_mut(second.0, second.1)
                .copy_from_slice(&src[first_bytes..first_bytes + second_bytes]);
        }
        frames
    }

    /// Fill up to `frames` of producer space with silence without
    /// publishing. Returns the number of frames zeroed.
    pub fn fill_silence(&self, frames: u32) -> u32 {
        let frames = frames.min(self.writable_frames());
        if frames == 0 {
            return 0;
        }
        let (first, second) = self.split_range(self.write_offset(), frames);
        self.sample_slice_mut(first.0, first.1).fill(0);
        if second.1 > 0 {
            self.sample_slice_mut(second.0, second.1).fill(0);
        }
        frames
    }

    /// Publish `frames` produced frames and stamp the write timestamp.
    pub fn advance_write(&self, frames: u32) {
        debug_assert!(frames <= self.writable_frames());
        self.stamp(OFF_WRITE_TS_SEC, OFF_WRITE_TS_NSEC);
        let off = self.header_u32(OFF_WRITE_OFFSET);
        let cur = off.load(Ordering::Relaxed);
        off.store(cur.wrapping_add(frames), Ordering::Release);
    }

    /// Consume `frames` frames and stamp the read timestamp.
    pub fn advance_read(&self, frames: u32) {
        debug_assert!(frames <= self.level());
        self.stamp(OFF_READ_TS_SEC, OFF_READ_TS_NSEC);
        let off = self.header_u32(OFF_READ_OFFSET);
        let cur = off.load(Ordering::Relaxed);
        off.store(cur.wrapping_add(frames), Ordering::Release);
    }

    pub fn set_callback_pending(&self, pending: bool) {
        self.header_u32(OFF_CALLBACK_PENDING)
            .store(pending as u32, Ordering::Relaxed);
    }

    pub fn callback_pending(&self) -> bool {
        self.header_u32(OFF_CALLBACK_PENDING).load(Ordering::Relaxed) != 0
    }

    /// Last write timestamp as `(sec, nsec)`.
    pub fn write_ts(&self) -> (u64, u64) {
        (
            self.header_u64(OFF_WRITE_TS_SEC).load(Ordering::Relaxed),
            self.header_u64(OFF_WRITE_TS_NSEC).load(Ordering::Relaxed),
        )
    }

    fn stamp(&self, sec_off: usize, nsec_off: usize) {
        if let Ok(now) = clock_gettime(ClockId::CLOCK_MONOTONIC) {
            self.header_u64(sec_off)
                .store(now.tv_sec() as u64, Ordering::Relaxed);
            self.header_u64(nsec_off)
                .store(now.tv_nsec() as u64, Ordering::Relaxed);
        }
    }

    /// Split a window starting at `offset` of `frames` frames into the two
    /// contiguous runs it occupies, as `((start_frame, frames), ...)`.
    fn split_range(&self, offset: u32, frames: u32) -> ((u32, u32), (u32, u32)) {
        let start = offset % self.used_size;
        let first = frames.min(self.used_size - start);
        ((start, first), (0, frames - first))
    }

    fn sample_slice(&self, start_frame: u32, frames: u32) -> &[u8] {
        let fb = self.frame_bytes as usize;
        let begin = SHM_HEADER_BYTES + start_frame as usize * fb;
        &self.map[begin..begin + frames as usize * fb]
    }

    #[allow(clippy::mut_from_ref)]
    fn sample_slice_mut(&self, start_frame: u32, frames: u32) -> &mut [u8] {
        let fb = self.frame_bytes as usize;
        let begin = SHM_HEADER_BYTES + start_frame as usize * fb;
        let len = frames as usize * fb;
        // SAFETY: the ring discipline gives the producer exclusive access to
        // [write_offset, write_offset + writable) and the consumer to
        // [read_offset, read_offset + level); callers stay inside the region
        // their role owns, so these slices never alias live reads.
        unsafe { std::slice::from_raw_parts_mut(self.map.as_ptr().add(begin) as *mut u8, len) }
    }
}

impl AsRawFd for AudioShm {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
