// C-linkage wrapper over the shmkv engine.
//
// Opaque handles mirror the native ownership: a map handle owns an
// `Arc<HashTab>`, a thread handle owns a `ThreadCtx`, a key handle owns a
// `KeyCtx` that borrows its thread handle. Every function returns a status
// code: `KvStatus` codes 0..=13, `ErrorCode` values from 100 for map and
// context errors, and `KV_MISUSE` for null or invalid arguments.
//
// Tracing: INFO for map create/attach/close and thread attach/detach,
// WARN for failed calls.

#![allow(
    unsafe_code,
    unsafe_op_in_unsafe_fn,
    clippy::cast_possible_wrap,
    clippy::missing_safety_doc
)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use parking_lot::Mutex;
use shmkv_core::{HashTab, KeyCtx, KeyIdentity, MapConfig, ThreadCtx};
use shmkv_error::{KvError, KvStatus};

// ── Status codes ────────────────────────────────────────────────────

pub const KV_OK: c_int = KvStatus::Ok as c_int;
pub const KV_IS_NEW: c_int = KvStatus::IsNew as c_int;
pub const KV_NOT_FOUND: c_int = KvStatus::NotFound as c_int;
pub const KV_BUSY: c_int = KvStatus::Busy as c_int;
pub const KV_HT_FULL: c_int = KvStatus::HtFull as c_int;
pub const KV_TOO_BIG: c_int = KvStatus::TooBig as c_int;
pub const KV_MSG_LIST_FULL: c_int = KvStatus::MsgListFull as c_int;
pub const KV_ALLOC_FAILED: c_int = KvStatus::AllocFailed as c_int;
pub const KV_MUTATED: c_int = KvStatus::Mutated as c_int;
pub const KV_NO_VALUE: c_int = KvStatus::NoValue as c_int;
pub const KV_TOMBSTONE: c_int = KvStatus::Tombstone as c_int;
pub const KV_PART_ONLY: c_int = KvStatus::PartOnly as c_int;
pub const KV_WRITE_ILLEGAL: c_int = KvStatus::WriteIllegal as c_int;
pub const KV_EXPIRED: c_int = KvStatus::Expired as c_int;
/// Null handle, bad UTF-8, or out-of-range argument.
pub const KV_MISUSE: c_int = -1;

// ── Last error ──────────────────────────────────────────────────────

static LAST_ERROR: Mutex<String> = Mutex::new(String::new());

fn set_error(err: &KvError) -> c_int {
    tracing::warn!(target: "shmkv.c_api", error = %err, "call failed");
    *LAST_ERROR.lock() = err.to_string();
    err.error_code() as c_int
}

const fn status(s: KvStatus) -> c_int {
    s.code() as c_int
}

// ── Opaque handle types ─────────────────────────────────────────────

/// A mapped region.
pub struct KvMap {
    tab: Arc<HashTab>,
}

/// A thread's context on a map. Must outlive every key handle made from it.
pub struct KvThread {
    thr: ThreadCtx,
}

/// A key operation context.
pub struct KvKey {
    kctx: KeyCtx<'static>,
}

unsafe fn c_str<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

unsafe fn bytes<'a>(p: *const u8, len: usize) -> Option<&'a [u8]> {
    if len == 0 {
        return Some(&[]);
    }
    if p.is_null() {
        return None;
    }
    Some(std::slice::from_raw_parts(p, len))
}

unsafe fn publish<T>(out: *mut *mut T, value: T) {
    *out = Box::into_raw(Box::new(value));
}

// ── Map lifecycle ───────────────────────────────────────────────────

/// Create a map from a `key=value` parameter string (null for defaults).
///
/// # Safety
/// `params` must be null or a valid NUL-terminated string. `out` must point
/// to writable storage for a handle pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_map_create(params: *const c_char, out: *mut *mut KvMap) -> c_int {
    if out.is_null() {
        return KV_MISUSE;
    }
    *out = std::ptr::null_mut();
    let params = if params.is_null() {
        ""
    } else {
        match c_str(params) {
            Some(s) => s,
            None => return KV_MISUSE,
        }
    };
    tracing::info!(target: "shmkv.c_api", params, "kv_map_create");
    let created = MapConfig::parse_params(params).and_then(|cfg| HashTab::create(&cfg));
    match created {
        Ok(tab) => {
            publish(out, KvMap { tab });
            KV_OK
        }
        Err(e) => set_error(&e),
    }
}

/// Attach to an existing named map, e.g. `file:/tmp/kv` or `posix:kv`.
///
/// # Safety
/// `backend` must be a valid NUL-terminated string; `out` as for
/// [`kv_map_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_map_attach(backend: *const c_char, out: *mut *mut KvMap) -> c_int {
    if out.is_null() {
        return KV_MISUSE;
    }
    *out = std::ptr::null_mut();
    let Some(backend) = c_str(backend) else {
        return KV_MISUSE;
    };
    tracing::info!(target: "shmkv.c_api", backend, "kv_map_attach");
    let attached = MapConfig::parse_params(&format!("backend={backend}"))
        .and_then(|cfg| HashTab::attach(&cfg.backend));
    match attached {
        Ok(tab) => {
            publish(out, KvMap { tab });
            KV_OK
        }
        Err(e) => set_error(&e),
    }
}

/// Drop a map handle. Thread handles keep the map alive until detached.
///
/// # Safety
/// `map` must be null or come from [`kv_map_create`]/[`kv_map_attach`], and
/// must not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_map_close(map: *mut KvMap) -> c_int {
    if map.is_null() {
        return KV_OK;
    }
    tracing::info!(target: "shmkv.c_api", "kv_map_close");
    drop(Box::from_raw(map));
    KV_OK
}

/// Flush a file-backed map.
///
/// # Safety
/// `map` must be a live map handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_map_flush(map: *const KvMap) -> c_int {
    let Some(map) = map.as_ref() else {
        return KV_MISUSE;
    };
    match map.tab.flush() {
        Ok(()) => KV_OK,
        Err(e) => set_error(&e),
    }
}

/// Number of hash cells.
///
/// # Safety
/// `map` must be a live map handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_map_cells(map: *const KvMap) -> u64 {
    map.as_ref().map_or(0, |m| m.tab.geom().ht_size)
}

/// Detect dead contexts and recover them. Returns how many were freed.
///
/// # Safety
/// `map` must be a live map handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_map_recover(map: *const KvMap) -> c_int {
    let Some(map) = map.as_ref() else {
        return KV_MISUSE;
    };
    map.tab
        .recover_dead()
        .iter()
        .filter(|r| r.complete())
        .count() as c_int
}

// ── Thread contexts ─────────────────────────────────────────────────

/// Attach the calling thread.
///
/// # Safety
/// `map` must be a live map handle; `out` writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_thread_attach(
    map: *const KvMap,
    caller_id: u64,
    out: *mut *mut KvThread,
) -> c_int {
    if out.is_null() {
        return KV_MISUSE;
    }
    *out = std::ptr::null_mut();
    let Some(map) = map.as_ref() else {
        return KV_MISUSE;
    };
    match map.tab.attach_ctx(caller_id) {
        Ok(thr) => {
            tracing::info!(target: "shmkv.c_api", ctx = %thr.id(), "kv_thread_attach");
            publish(out, KvThread { thr });
            KV_OK
        }
        Err(e) => set_error(&e),
    }
}

/// Detach a thread context.
///
/// # Safety
/// `thr` must be null or a live thread handle with no key handles left.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_thread_detach(thr: *mut KvThread) -> c_int {
    if thr.is_null() {
        return KV_OK;
    }
    drop(Box::from_raw(thr));
    KV_OK
}

/// Open database `db` for statistics.
///
/// # Safety
/// `thr` must be a live thread handle used from its own thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_db_attach(thr: *const KvThread, db: u32) -> c_int {
    let (Some(thr), Ok(db)) = (thr.as_ref(), u8::try_from(db)) else {
        return KV_MISUSE;
    };
    match thr.thr.attach_db(db) {
        Ok(()) => KV_OK,
        Err(e) => set_error(&e),
    }
}

/// Fold and unlink this context's statistics for `db`.
///
/// # Safety
/// As for [`kv_db_attach`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_db_detach(thr: *const KvThread, db: u32) -> c_int {
    let (Some(thr), Ok(db)) = (thr.as_ref(), u8::try_from(db)) else {
        return KV_MISUSE;
    };
    thr.thr.detach_db(db);
    KV_OK
}

/// Compact segment `seg`, returning bytes reclaimed (or `KV_MISUSE`).
///
/// # Safety
/// As for [`kv_db_attach`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_gc(thr: *const KvThread, seg: u32) -> i64 {
    let Some(thr) = thr.as_ref() else {
        return i64::from(KV_MISUSE);
    };
    let report = thr.thr.table().gc_segment(&thr.thr, seg as usize);
    report.reclaimed as i64
}

// ── Key contexts ────────────────────────────────────────────────────

/// Create a key context for database `db`.
///
/// # Safety
/// `thr` must be a live thread handle that outlives the key handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_key_create(
    thr: *const KvThread,
    db: u32,
    out: *mut *mut KvKey,
) -> c_int {
    if out.is_null() {
        return KV_MISUSE;
    }
    *out = std::ptr::null_mut();
    let (Some(thr), Ok(db)) = (thr.as_ref(), u8::try_from(db)) else {
        return KV_MISUSE;
    };
    let thr: &'static ThreadCtx = &thr.thr;
    match KeyCtx::new(thr, db) {
        Ok(kctx) => {
            publish(out, KvKey { kctx });
            KV_OK
        }
        Err(e) => set_error(&e),
    }
}

/// Free a key context, releasing any held cell.
///
/// # Safety
/// `key` must be null or a live key handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_key_free(key: *mut KvKey) -> c_int {
    if !key.is_null() {
        drop(Box::from_raw(key));
    }
    KV_OK
}

/// Set the key bytes.
///
/// # Safety
/// `key` must be a live key handle; `data` must point to `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_key_set(key: *mut KvKey, data: *const u8, len: usize) -> c_int {
    let (Some(key), Some(data)) = (key.as_mut(), bytes(data, len)) else {
        return KV_MISUSE;
    };
    key.kctx.set_key(data);
    KV_OK
}

/// Set the key bytes with a hash pair the caller already computed.
///
/// # Safety
/// As for [`kv_key_set`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_key_set_hash(
    key: *mut KvKey,
    data: *const u8,
    len: usize,
    hash: u64,
    hash2: u64,
) -> c_int {
    let (Some(key), Some(data)) = (key.as_mut(), bytes(data, len)) else {
        return KV_MISUSE;
    };
    key.kctx.set_key_hash(data, KeyIdentity::new(hash, hash2));
    KV_OK
}

macro_rules! key_op {
    ($(#[$doc:meta])* $name:ident => $method:ident) => {
        $(#[$doc])*
        ///
        /// # Safety
        /// `key` must be a live key handle.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name(key: *mut KvKey) -> c_int {
            match key.as_mut() {
                Some(key) => status(key.kctx.$method()),
                None => KV_MISUSE,
            }
        }
    };
}

key_op!(
    /// Lock the key's cell, claiming one if absent.
    kv_acquire => acquire
);
key_op!(
    /// Like [`kv_acquire`] but returns `KV_BUSY` instead of waiting.
    kv_try_acquire => try_acquire
);
key_op!(
    /// Look the key up without locking.
    kv_find => find
);
key_op!(
    /// Publish changes and unlock.
    kv_release => release
);
key_op!(
    /// Tombstone the held key.
    kv_tombstone => tombstone
);
key_op!(
    /// Tombstone the held key, counting it as expired.
    kv_expire => expire
);

/// Read the cell at directory position `pos`.
///
/// # Safety
/// `key` must be a live key handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_fetch(key: *mut KvKey, pos: u64) -> c_int {
    match key.as_mut() {
        Some(key) => status(key.kctx.fetch(pos as usize)),
        None => KV_MISUSE,
    }
}

/// Replace the value with `len` bytes at `data`.
///
/// # Safety
/// `key` must be a live key handle; `data` must point to `len` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_load(key: *mut KvKey, data: *const u8, len: usize) -> c_int {
    let (Some(key), Some(data)) = (key.as_mut(), bytes(data, len)) else {
        return KV_MISUSE;
    };
    status(key.kctx.load(data))
}

/// Overwrite part of the value.
///
/// # Safety
/// As for [`kv_load`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_write(
    key: *mut KvKey,
    offset: usize,
    data: *const u8,
    len: usize,
) -> c_int {
    let (Some(key), Some(data)) = (key.as_mut(), bytes(data, len)) else {
        return KV_MISUSE;
    };
    status(key.kctx.write(offset, data))
}

/// Allocate a zeroed value of `size` bytes.
///
/// # Safety
/// `key` must be a live key handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_alloc(key: *mut KvKey, size: usize) -> c_int {
    match key.as_mut() {
        Some(key) => status(key.kctx.alloc(size)),
        None => KV_MISUSE,
    }
}

/// Resize the value, keeping its prefix.
///
/// # Safety
/// `key` must be a live key handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_resize(key: *mut KvKey, size: usize) -> c_int {
    match key.as_mut() {
        Some(key) => status(key.kctx.resize(size)),
        None => KV_MISUSE,
    }
}

/// Append one record to a list value.
///
/// # Safety
/// As for [`kv_load`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_append(key: *mut KvKey, data: *const u8, len: usize) -> c_int {
    let (Some(key), Some(data)) = (key.as_mut(), bytes(data, len)) else {
        return KV_MISUSE;
    };
    status(key.kctx.append_vector(&[data]))
}

/// Set the expiration time in nanoseconds since the epoch; 0 clears it.
///
/// # Safety
/// `key` must be a live key handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_set_expire_ns(key: *mut KvKey, ns: u64) -> c_int {
    match key.as_mut() {
        Some(key) => status(key.kctx.set_expire_ns(ns)),
        None => KV_MISUSE,
    }
}

/// Set the caller-defined type byte of the held value.
///
/// # Safety
/// `key` must be a live key handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_set_type(key: *mut KvKey, value_type: u8) -> c_int {
    match key.as_mut() {
        Some(key) => status(key.kctx.set_type(value_type)),
        None => KV_MISUSE,
    }
}

/// Copy the value into `buf`. `out_len` receives the full value length;
/// `KV_PART_ONLY` when `buf` was too short.
///
/// # Safety
/// `key` must be a live key handle; `buf` must point to `cap` writable
/// bytes; `out_len` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_value(
    key: *const KvKey,
    buf: *mut u8,
    cap: usize,
    out_len: *mut usize,
) -> c_int {
    let Some(key) = key.as_ref() else {
        return KV_MISUSE;
    };
    if buf.is_null() && cap != 0 {
        return KV_MISUSE;
    }
    let value = match key.kctx.value() {
        Ok(v) => v,
        Err(s) => return status(s),
    };
    if !out_len.is_null() {
        *out_len = value.len();
    }
    let n = value.len().min(cap);
    if n > 0 {
        std::ptr::copy_nonoverlapping(value.as_ptr(), buf, n);
    }
    if n < value.len() { KV_PART_ONLY } else { KV_OK }
}

/// Number of records in a list value, or a negated status.
///
/// # Safety
/// `key` must be a live key handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_msg_count(key: *const KvKey) -> i64 {
    match key.as_ref() {
        Some(key) => match key.kctx.msg_count() {
            Ok(n) => n as i64,
            Err(s) => -i64::from(status(s)),
        },
        None => i64::from(KV_MISUSE),
    }
}

// ── Diagnostics ─────────────────────────────────────────────────────

/// Static description of a status code.
#[unsafe(no_mangle)]
pub extern "C" fn kv_status_str(code: c_int) -> *const c_char {
    let text: &'static CStr = match KvStatus::from_code(code) {
        Some(KvStatus::Ok) => c"ok",
        Some(KvStatus::IsNew) => c"is_new",
        Some(KvStatus::NotFound) => c"not_found",
        Some(KvStatus::Busy) => c"busy",
        Some(KvStatus::HtFull) => c"ht_full",
        Some(KvStatus::TooBig) => c"too_big",
        Some(KvStatus::MsgListFull) => c"msg_list_full",
        Some(KvStatus::AllocFailed) => c"alloc_failed",
        Some(KvStatus::Mutated) => c"mutated",
        Some(KvStatus::NoValue) => c"no_value",
        Some(KvStatus::Tombstone) => c"tombstone",
        Some(KvStatus::PartOnly) => c"part_only",
        Some(KvStatus::WriteIllegal) => c"write_illegal",
        Some(KvStatus::Expired) => c"expired",
        None if code == KV_MISUSE => c"misuse",
        None => c"error",
    };
    text.as_ptr()
}

/// Copy the message of the most recent failed map or context call into
/// `buf` (NUL-terminated, truncated to fit). Returns the full message
/// length, 0 if no call has failed yet.
///
/// # Safety
/// `buf` must be null or point to `cap` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kv_last_error(buf: *mut c_char, cap: usize) -> usize {
    let msg = LAST_ERROR.lock();
    if !buf.is_null() && cap > 0 {
        let n = msg.len().min(cap - 1);
        std::ptr::copy_nonoverlapping(msg.as_ptr(), buf.cast::<u8>(), n);
        *buf.add(n) = 0;
    }
    msg.len()
}
