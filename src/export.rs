//! Exports: named block devices, the storage behind them, and the registry the
//! server looks them up in.
#![deny(missing_docs)]
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, info};

use crate::conn::ConnShared;
use crate::errors::{ErrorKind, NbdError};
use crate::proto::{TransmitFlags, MAX_STRING_SIZE};

/// Granularity export sizes are rounded down to.
pub const SECTOR_SIZE: u64 = 512;

/// Allocation status of a run of bytes, as reported by a backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Length of the run in bytes.
    pub len: u64,
    /// Whether storage is allocated for the run.
    pub allocated: bool,
    /// Whether the run is known to read as zeroes.
    pub zero: bool,
}

/// Blocks is a byte array that can be exported by this server, with a basic
/// read/write API that works on arbitrary offsets.
///
/// Blocks is implemented for unix files (using the underlying `pread` and
/// `pwrite` system calls) and for [`MemBlocks`] for exporting an in-memory byte
/// array. Only `read_at`, `write_at`, `size` and `flush` are required; the
/// other operations have conservative defaults.
pub trait Blocks: Send + Sync {
    /// Fill buf starting from off (reading `buf.len()` bytes)
    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()>;

    /// Write data from buf to self starting at off (writing `buf.len()`
    /// bytes). With `fua`, the data must be on stable storage on return.
    fn write_at(&self, buf: &[u8], off: u64, fua: bool) -> io::Result<()>;

    /// Get the size of this array (in bytes)
    fn size(&self) -> io::Result<u64>;

    /// Flush any outstanding writes to stable storage.
    fn flush(&self) -> io::Result<()>;

    /// Discard a range; its contents become unspecified.
    fn trim(&self, _off: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// Make a range read as zeroes. `may_unmap` allows deallocating it;
    /// `no_fallback` forbids the slow path of writing explicit zeroes, in which
    /// case an implementation without a fast path fails with `Unsupported`.
    fn write_zeroes(&self, off: u64, len: u64, _may_unmap: bool, no_fallback: bool) -> io::Result<()> {
        if no_fallback {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no fast zeroing available",
            ));
        }
        let zeroes = vec![0u8; (len as usize).min(1 << 20)];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(zeroes.len() as u64) as usize;
            self.write_at(&zeroes[..n], off + done, false)?;
            done += n as u64;
        }
        Ok(())
    }

    /// Prefetch a range.
    fn cache(&self, _off: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// Describe the allocation status starting at `off`, covering at most
    /// `len` bytes. Must return at least one non-empty run on success.
    fn block_status(&self, _off: u64, len: u64) -> io::Result<Vec<Allocation>> {
        Ok(vec![Allocation {
            len,
            allocated: true,
            zero: false,
        }])
    }

    /// Depth of the layer each run is allocated in (0 for unallocated).
    fn allocation_depth(&self, off: u64, len: u64) -> io::Result<Vec<(u64, u32)>> {
        Ok(self
            .block_status(off, len)?
            .into_iter()
            .map(|a| (a.len, a.allocated as u32))
            .collect())
    }

    /// Whether the store refuses everything but reads (eg, during migration).
    fn is_inactive(&self) -> bool {
        false
    }

    /// Alignment requests must respect.
    fn request_alignment(&self) -> u32 {
        1
    }

    /// Largest transfer the store handles in one request.
    fn max_transfer(&self) -> u32 {
        u32::MAX
    }

    /// Find a dirty bitmap attached to this store.
    fn dirty_bitmap(&self, _name: &str) -> Option<Arc<dyn DirtyBitmap>> {
        None
    }
}

impl Blocks for File {
    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        FileExt::read_exact_at(self, buf, off)
    }

    fn write_at(&self, buf: &[u8], off: u64, fua: bool) -> io::Result<()> {
        FileExt::write_all_at(self, buf, off)?;
        if fua {
            self.sync_data()?;
        }
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }

    fn flush(&self) -> io::Result<()> {
        self.sync_all()?;
        Ok(())
    }
}

/// A named set of dirty ranges that can be exposed as a meta context.
pub trait DirtyBitmap: Send + Sync {
    /// Name of the bitmap, as used in `qemu:dirty-bitmap:<name>`.
    fn name(&self) -> &str;

    /// Dirty status starting at `off`, covering at most `len` bytes, as runs
    /// of `(length, dirty)`.
    fn dirty_ranges(&self, off: u64, len: u64) -> Vec<(u64, bool)>;

    /// Claim exclusive use; false if someone else holds it.
    fn claim(&self) -> bool;

    /// Give up a claim taken with [`DirtyBitmap::claim`].
    fn release(&self);
}

/// In-memory dirty bitmap with a fixed granularity.
pub struct MemBitmap {
    name: String,
    granularity: u64,
    dirty: Mutex<Vec<bool>>,
    busy: AtomicBool,
}

impl MemBitmap {
    /// Create a clean bitmap covering `size` bytes.
    pub fn new<S: Into<String>>(name: S, size: u64, granularity: u64) -> Self {
        assert!(granularity.is_power_of_two());
        let chunks = ((size + granularity - 1) / granularity) as usize;
        Self {
            name: name.into(),
            granularity,
            dirty: Mutex::new(vec![false; chunks]),
            busy: AtomicBool::new(false),
        }
    }

    /// Mark every chunk touching `[off, off+len)` as dirty.
    pub fn mark_dirty(&self, off: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut dirty = self.dirty.lock().unwrap();
        let first = (off / self.granularity) as usize;
        let last = ((off + len - 1) / self.granularity) as usize;
        for chunk in first..=last.min(dirty.len().saturating_sub(1)) {
            dirty[chunk] = true;
        }
    }

    /// Whether some claim is active.
    pub fn busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MemBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBitmap")
            .field("name", &self.name)
            .field("granularity", &self.granularity)
            .field("busy", &self.busy())
            .finish_non_exhaustive()
    }
}

impl DirtyBitmap for MemBitmap {
    fn name(&self) -> &str {
        &self.name
    }

    fn dirty_ranges(&self, off: u64, len: u64) -> Vec<(u64, bool)> {
        let dirty = self.dirty.lock().unwrap();
        let end = off + len;
        let mut runs: Vec<(u64, bool)> = vec![];
        let mut pos = off;
        while pos < end {
            let chunk = (pos / self.granularity) as usize;
            let chunk_end = ((chunk as u64 + 1) * self.granularity).min(end);
            let d = dirty.get(chunk).copied().unwrap_or(false);
            match runs.last_mut() {
                Some((n, last)) if *last == d => *n += chunk_end - pos,
                _ => runs.push((chunk_end - pos, d)),
            }
            pos = chunk_end;
        }
        runs
    }

    fn claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct MemState {
    data: Vec<u8>,
    // one entry per SECTOR_SIZE sector
    allocated: Vec<bool>,
}

/// MemBlocks is a convenience for an in-memory implementation of Blocks using
/// an array of bytes.
///
/// Allocation is tracked per 512-byte sector: writes allocate, trims and
/// unmapping zero-writes deallocate. Writes mark every attached bitmap dirty.
#[derive(Clone)]
pub struct MemBlocks {
    state: Arc<Mutex<MemState>>,
    bitmaps: Arc<Mutex<Vec<Arc<MemBitmap>>>>,
    inactive: Arc<AtomicBool>,
    alignment: u32,
}

impl MemBlocks {
    /// Create a new MemBlocks from an in-memory array, fully allocated.
    pub fn new(data: Vec<u8>) -> Self {
        let sectors = Self::sectors(data.len() as u64);
        Self::from_state(MemState {
            data,
            allocated: vec![true; sectors],
        })
    }

    /// Create a MemBlocks of `size` zero bytes with nothing allocated.
    pub fn sparse(size: u64) -> Self {
        Self::from_state(MemState {
            data: vec![0; size as usize],
            allocated: vec![false; Self::sectors(size)],
        })
    }

    fn from_state(state: MemState) -> Self {
        MemBlocks {
            state: Arc::new(Mutex::new(state)),
            bitmaps: Arc::new(Mutex::new(vec![])),
            inactive: Arc::new(AtomicBool::new(false)),
            alignment: 1,
        }
    }

    fn sectors(size: u64) -> usize {
        ((size + SECTOR_SIZE - 1) / SECTOR_SIZE) as usize
    }

    /// Report `alignment` as the request alignment.
    pub fn with_alignment(mut self, alignment: u32) -> Self {
        assert!(alignment.is_power_of_two());
        self.alignment = alignment;
        self
    }

    /// Attach a bitmap that writes will mark dirty.
    pub fn add_bitmap(&self, bitmap: Arc<MemBitmap>) {
        self.bitmaps.lock().unwrap().push(bitmap);
    }

    /// Make the store refuse everything except reads.
    pub fn set_inactive(&self, inactive: bool) {
        self.inactive.store(inactive, Ordering::SeqCst);
    }

    fn check_range(len: usize, off: u64, n: u64, what: &str) -> io::Result<usize> {
        match off.checked_add(n) {
            Some(end) if end <= len as u64 => Ok(off as usize),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("out-of-bounds {what}"),
            )),
        }
    }

    fn set_allocated(state: &mut MemState, off: u64, len: u64, allocated: bool) {
        if len == 0 {
            return;
        }
        let (first, last) = if allocated {
            // any touched sector becomes allocated
            (off / SECTOR_SIZE, (off + len - 1) / SECTOR_SIZE)
        } else {
            // only sectors entirely inside the range can be dropped
            let first = (off + SECTOR_SIZE - 1) / SECTOR_SIZE;
            let end = (off + len) / SECTOR_SIZE;
            if end == 0 || first > end - 1 {
                return;
            }
            (first, end - 1)
        };
        for s in first..=last {
            if let Some(a) = state.allocated.get_mut(s as usize) {
                *a = allocated;
            }
        }
    }

    fn mark_dirty(&self, off: u64, len: u64) {
        for bitmap in self.bitmaps.lock().unwrap().iter() {
            bitmap.mark_dirty(off, len);
        }
    }
}

impl fmt::Debug for MemBlocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.state.lock().unwrap().data.len();
        f.debug_struct("MemBlocks")
            .field("len", &len)
            .field("alignment", &self.alignment)
            .finish_non_exhaustive()
    }
}

impl Blocks for MemBlocks {
    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        let off = Self::check_range(state.data.len(), off, buf.len() as u64, "read")?;
        buf.copy_from_slice(&state.data[off..off + buf.len()]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], off: u64, _fua: bool) -> io::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let start = Self::check_range(state.data.len(), off, buf.len() as u64, "write")?;
            state.data[start..start + buf.len()].copy_from_slice(buf);
            Self::set_allocated(&mut state, off, buf.len() as u64, true);
        }
        self.mark_dirty(off, buf.len() as u64);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.data.len() as u64)
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn trim(&self, off: u64, len: u64) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let start = Self::check_range(state.data.len(), off, len, "trim")?;
        state.data[start..start + len as usize].fill(0);
        Self::set_allocated(&mut state, off, len, false);
        drop(state);
        self.mark_dirty(off, len);
        Ok(())
    }

    fn write_zeroes(&self, off: u64, len: u64, may_unmap: bool, _no_fallback: bool) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let start = Self::check_range(state.data.len(), off, len, "write zeroes")?;
        state.data[start..start + len as usize].fill(0);
        Self::set_allocated(&mut state, off, len, !may_unmap);
        drop(state);
        self.mark_dirty(off, len);
        Ok(())
    }

    fn block_status(&self, off: u64, len: u64) -> io::Result<Vec<Allocation>> {
        let state = self.state.lock().unwrap();
        Self::check_range(state.data.len(), off, len, "block status")?;
        let end = off + len;
        let mut runs: Vec<Allocation> = vec![];
        let mut pos = off;
        while pos < end {
            let sector = pos / SECTOR_SIZE;
            let sector_end = ((sector + 1) * SECTOR_SIZE).min(end);
            let allocated = state.allocated[sector as usize];
            let zero = !allocated
                || state.data[pos as usize..sector_end as usize]
                    .iter()
                    .all(|&b| b == 0);
            match runs.last_mut() {
                Some(last) if last.allocated == allocated && last.zero == zero => {
                    last.len += sector_end - pos
                }
                _ => runs.push(Allocation {
                    len: sector_end - pos,
                    allocated,
                    zero,
                }),
            }
            pos = sector_end;
        }
        Ok(runs)
    }

    fn is_inactive(&self) -> bool {
        self.inactive.load(Ordering::SeqCst)
    }

    fn request_alignment(&self) -> u32 {
        self.alignment
    }

    fn dirty_bitmap(&self, name: &str) -> Option<Arc<dyn DirtyBitmap>> {
        self.bitmaps
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.name() == name)
            .map(|b| b.clone() as Arc<dyn DirtyBitmap>)
    }
}

/// Settings for a new export.
#[derive(Debug, Clone, Default)]
pub struct ExportConfig {
    /// Name clients select the export by.
    pub name: String,
    /// Optional description, sent with `NBD_INFO_DESCRIPTION`.
    pub description: Option<String>,
    /// Refuse writes.
    pub read_only: bool,
    /// Treat every write as if it carried FUA.
    pub writethrough: bool,
    /// Advertise that multiple connections see consistent data.
    pub multi_conn: bool,
    /// Offer the `qemu:allocation-depth` meta context.
    pub allocation_depth: bool,
    /// Names of dirty bitmaps (found through the backing store) to expose.
    pub bitmaps: Vec<String>,
}

impl ExportConfig {
    /// A writable export with default settings.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A named block device made available to clients.
pub struct Export {
    name: String,
    description: Option<String>,
    size: u64,
    flags: TransmitFlags,
    writethrough: bool,
    allocation_depth: bool,
    blocks: Arc<dyn Blocks>,
    bitmaps: Vec<Arc<dyn DirtyBitmap>>,
    clients: Mutex<HashMap<u64, Arc<ConnShared>>>,
}

impl Export {
    /// Validate the config and build an export; claims every bitmap.
    pub fn new(config: ExportConfig, blocks: Arc<dyn Blocks>) -> Result<Self, NbdError> {
        if config.name.len() > MAX_STRING_SIZE {
            return Err(NbdError::invalid(format!(
                "export name is longer than {MAX_STRING_SIZE} bytes"
            )));
        }
        if let Some(desc) = &config.description {
            if desc.len() > MAX_STRING_SIZE {
                return Err(NbdError::invalid(format!(
                    "export description is longer than {MAX_STRING_SIZE} bytes"
                )));
            }
        }
        let size = blocks.size().map_err(|err| NbdError::from_io(&err))?;
        let size = size - size % SECTOR_SIZE;

        let mut bitmaps: Vec<Arc<dyn DirtyBitmap>> = vec![];
        for name in &config.bitmaps {
            let bitmap = match blocks.dirty_bitmap(name) {
                Some(bitmap) => bitmap,
                None => {
                    Self::release_all(&bitmaps);
                    return Err(NbdError::new(
                        ErrorKind::NotFound,
                        format!("bitmap '{name}' not found"),
                    ));
                }
            };
            if !bitmap.claim() {
                Self::release_all(&bitmaps);
                return Err(NbdError::new(
                    ErrorKind::PermissionDenied,
                    format!("bitmap '{name}' is in use"),
                ));
            }
            bitmaps.push(bitmap);
        }

        let mut flags = TransmitFlags::HAS_FLAGS
            | TransmitFlags::SEND_FLUSH
            | TransmitFlags::SEND_FUA
            | TransmitFlags::SEND_CACHE;
        if config.read_only {
            flags |= TransmitFlags::READ_ONLY | TransmitFlags::CAN_MULTI_CONN;
        } else {
            flags |= TransmitFlags::SEND_TRIM
                | TransmitFlags::SEND_WRITE_ZEROES
                | TransmitFlags::SEND_FAST_ZERO;
        }
        if config.multi_conn {
            flags |= TransmitFlags::CAN_MULTI_CONN;
        }

        Ok(Export {
            name: config.name,
            description: config.description,
            size,
            flags,
            writethrough: config.writethrough,
            allocation_depth: config.allocation_depth,
            blocks,
            bitmaps,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn release_all(bitmaps: &[Arc<dyn DirtyBitmap>]) {
        for b in bitmaps {
            b.release();
        }
    }

    /// Name clients select the export by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optional description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Size in bytes, rounded down to [`SECTOR_SIZE`].
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Advertised transmission flags, before per-connection additions.
    pub fn flags(&self) -> TransmitFlags {
        self.flags
    }

    /// Whether writes are refused.
    pub fn read_only(&self) -> bool {
        self.flags.contains(TransmitFlags::READ_ONLY)
    }

    /// Whether every write is forced to stable storage.
    pub fn writethrough(&self) -> bool {
        self.writethrough
    }

    /// Whether `qemu:allocation-depth` is offered.
    pub fn allocation_depth(&self) -> bool {
        self.allocation_depth
    }

    /// The backing store.
    pub fn blocks(&self) -> &dyn Blocks {
        self.blocks.as_ref()
    }

    /// Exposed bitmaps, in context-ID order.
    pub fn bitmaps(&self) -> &[Arc<dyn DirtyBitmap>] {
        &self.bitmaps
    }

    /// Number of attached connections.
    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn attach(&self, conn: Arc<ConnShared>) {
        debug!("export '{}': attaching connection {}", self.name, conn.id());
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id(), conn);
    }

    pub(crate) fn detach(&self, id: u64) {
        debug!("export '{}': detaching connection {id}", self.name);
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }

    fn attached(&self) -> Vec<Arc<ConnShared>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Pause request execution on every attached connection and wait until
    /// their in-flight requests finished.
    pub fn quiesce_clients(&self) {
        for conn in self.attached() {
            conn.quiesce();
        }
    }

    /// Undo [`Export::quiesce_clients`].
    pub fn resume_clients(&self) {
        for conn in self.attached() {
            conn.resume();
        }
    }

    /// Shut down the transport of every attached connection.
    pub fn close_clients(&self) {
        for conn in self.attached() {
            conn.close();
        }
    }
}

impl Drop for Export {
    fn drop(&mut self) {
        debug!("export '{}': releasing {} bitmaps", self.name, self.bitmaps.len());
        Self::release_all(&self.bitmaps);
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Export")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// How [`ExportRegistry::remove`] treats attached clients.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RemoveMode {
    /// Refuse while any client is attached.
    Safe,
    /// Disconnect attached clients.
    Hard,
}

/// Process-wide table of exports, in creation order.
///
/// Lookups and listings see either the table before or after a
/// create/remove, never a partial update.
#[derive(Debug, Default)]
pub struct ExportRegistry {
    exports: RwLock<Vec<Arc<Export>>>,
}

impl ExportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register an export.
    pub fn create(
        &self,
        config: ExportConfig,
        blocks: Arc<dyn Blocks>,
    ) -> Result<Arc<Export>, NbdError> {
        // checked again under the write lock; this avoids claiming bitmaps
        // for an export that cannot be registered
        if self.lookup(&config.name).is_some() {
            return Err(NbdError::invalid(format!(
                "export '{}' already exists",
                config.name
            )));
        }
        let export = Arc::new(Export::new(config, blocks)?);
        let mut exports = self.exports.write().unwrap_or_else(PoisonError::into_inner);
        if exports.iter().any(|e| e.name() == export.name()) {
            return Err(NbdError::invalid(format!(
                "export '{}' already exists",
                export.name()
            )));
        }
        info!(
            "created export '{}' ({} bytes, {:?})",
            export.name(),
            export.size(),
            export.flags()
        );
        exports.push(export.clone());
        Ok(export)
    }

    /// Find an export by exact name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Export>> {
        self.exports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.name() == name)
            .cloned()
    }

    /// All exports, in creation order.
    pub fn list(&self) -> Vec<Arc<Export>> {
        self.exports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Unregister an export. The export itself lives on until the last
    /// connection using it is gone.
    pub fn remove(&self, name: &str, mode: RemoveMode) -> Result<(), NbdError> {
        let mut exports = self.exports.write().unwrap_or_else(PoisonError::into_inner);
        let idx = exports
            .iter()
            .position(|e| e.name() == name)
            .ok_or_else(|| {
                NbdError::new(ErrorKind::NotFound, format!("export '{name}' not found"))
            })?;
        let export = &exports[idx];
        match mode {
            RemoveMode::Safe if export.client_count() > 0 => {
                return Err(NbdError::new(
                    ErrorKind::ShuttingDown,
                    format!("export '{name}' still in use"),
                ));
            }
            RemoveMode::Safe => {}
            RemoveMode::Hard => export.close_clients(),
        }
        info!("removed export '{name}'");
        exports.remove(idx);
        Ok(())
    }
}
