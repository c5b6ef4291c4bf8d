//! Arène mémoire partagée à layout fixe (named-table arena).
//!
//! Le process Time crée chaque table au démarrage; le process Status ne fait
//! jamais que les ouvrir en lecture. Une fois créée, une table ne change plus
//! ni de taille ni d'offset: les `TableHandle<T>` peuvent être mis en cache
//! sans crainte de réallocation.

use libc::{
    c_void, mmap, mode_t, shm_open, shm_unlink, MAP_FAILED, MAP_SHARED, O_CREAT, O_RDONLY,
    O_RDWR, PROT_READ, PROT_WRITE,
};
use std::ffi::CString;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const MAX_NAME: usize = 31;
const HASH_BUCKETS: usize = 61;

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("table name already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("arena out of memory (requested {requested}, remaining {remaining})")]
    OutOfMemory { requested: u64, remaining: u64 },
    #[error("table not found: {0}")]
    NotFound(String),
    #[error(
        "table record layout mismatch for {name}: stored record_size {stored}, requested {requested}"
    )]
    LayoutMismatch {
        name: String,
        stored: u64,
        requested: u64,
    },
    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

/// En-tête de l'arène, placé en tout début de la région mappée.
#[repr(C)]
struct ArenaHeader {
    total_size: u64,
    used_offset: AtomicU64,
    hash_bucket: [AtomicU64; HASH_BUCKETS], // offset de la 1re table du bucket, 0 = vide
}

/// En-tête d'une table, immédiatement suivi de `record_size * count` octets.
#[repr(C)]
struct TableHeader {
    next_offset: u64,
    size: u64,
    name: [u8; MAX_NAME + 1],
    record_size: u64,
    count: u64,
}

fn hash_name(name: &str) -> usize {
    let mut h: u32 = 2166136261;
    for b in name.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(16777619);
    }
    (h as usize) % HASH_BUCKETS
}

fn encode_name(name: &str) -> Result<[u8; MAX_NAME + 1], ArenaError> {
    if name.is_empty() || name.len() > MAX_NAME {
        return Err(ArenaError::InvalidArgument(format!(
            "table name must be 1..={} bytes: {name}",
            MAX_NAME
        )));
    }
    let mut buf = [0u8; MAX_NAME + 1];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    Ok(buf)
}

fn decode_name(buf: &[u8; MAX_NAME + 1]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Région mémoire partagée entre le process Time (créateur, lecture/écriture)
/// et le process Status (lecture seule).
pub struct SharedArena {
    base: *mut u8,
    len: usize,
    owner: bool,
    path: CString,
}

unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

impl SharedArena {
    /// Crée (ou réinitialise) l'arène. Appelé uniquement par le process Time.
    pub fn create(name: &str, total_size: usize) -> Result<Self, ArenaError> {
        let path = CString::new(format!("/{name}")).map_err(|_| {
            ArenaError::InvalidArgument("arena name must not contain NUL".to_string())
        })?;

        let fd = unsafe {
            shm_open(
                path.as_ptr(),
                O_CREAT | O_RDWR,
                0o600 as mode_t,
            )
        };
        if fd < 0 {
            return Err(ArenaError::System(std::io::Error::last_os_error()));
        }

        if unsafe { libc::ftruncate(fd, total_size as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ArenaError::System(err));
        }

        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                total_size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if base == MAP_FAILED {
            return Err(ArenaError::System(std::io::Error::last_os_error()));
        }

        let base = base as *mut u8;
        let header = base as *mut ArenaHeader;
        unsafe {
            (*header).total_size = total_size as u64;
            (*header)
                .used_offset
                .store(size_of::<ArenaHeader>() as u64, Ordering::Relaxed);
            for bucket in (*header).hash_bucket.iter() {
                bucket.store(0, Ordering::Relaxed);
            }
        }

        Ok(SharedArena {
            base,
            len: total_size,
            owner: true,
            path,
        })
    }

    /// Ouvre une arène déjà créée, en lecture seule. Appelé par le process Status.
    pub fn open_readonly(name: &str) -> Result<Self, ArenaError> {
        let path = CString::new(format!("/{name}")).map_err(|_| {
            ArenaError::InvalidArgument("arena name must not contain NUL".to_string())
        })?;

        let fd = unsafe { shm_open(path.as_ptr(), O_RDONLY, 0) };
        if fd < 0 {
            return Err(ArenaError::System(std::io::Error::last_os_error()));
        }

        // La taille réelle de l'arène est lue depuis l'en-tête après un premier
        // mapping couvrant au moins l'en-tête lui-même.
        let probe_len = size_of::<ArenaHeader>();
        let probe = unsafe {
            mmap(
                std::ptr::null_mut(),
                probe_len,
                PROT_READ,
                MAP_SHARED,
                fd,
                0,
            )
        };
        if probe == MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(ArenaError::System(std::io::Error::last_os_error()));
        }
        let total_size = unsafe { (*(probe as *const ArenaHeader)).total_size } as usize;
        unsafe { libc::munmap(probe, probe_len) };

        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                total_size,
                PROT_READ,
                MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if base == MAP_FAILED {
            return Err(ArenaError::System(std::io::Error::last_os_error()));
        }

        Ok(SharedArena {
            base: base as *mut u8,
            len: total_size,
            owner: false,
            path,
        })
    }

    fn header(&self) -> &ArenaHeader {
        unsafe { &*(self.base as *const ArenaHeader) }
    }

    /// Crée une nouvelle table nommée et retourne un handle typé dessus.
    pub fn create_table<T: Copy>(
        &self,
        name: &str,
        count: usize,
    ) -> Result<TableHandle<T>, ArenaError> {
        if !self.owner {
            return Err(ArenaError::InvalidArgument(
                "cannot create a table on a read-only arena".to_string(),
            ));
        }
        if count == 0 {
            return Err(ArenaError::InvalidArgument(
                "table count must be > 0".to_string(),
            ));
        }
        let name_buf = encode_name(name)?;
        let bucket = hash_name(name);
        let header = self.header();

        // Rejette les doublons en parcourant la chaîne du bucket.
        let mut cursor = header.hash_bucket[bucket].load(Ordering::Acquire);
        while cursor != 0 {
            let table = unsafe { &*(self.base.add(cursor as usize) as *const TableHeader) };
            if decode_name(&table.name) == name {
                return Err(ArenaError::AlreadyExists(name.to_string()));
            }
            cursor = table.next_offset;
        }

        let record_size = size_of::<T>() as u64;
        let required = size_of::<TableHeader>() as u64 + record_size * count as u64;

        let offset = loop {
            let current = header.used_offset.load(Ordering::Acquire);
            let remaining = header.total_size.saturating_sub(current);
            if required > remaining {
                return Err(ArenaError::OutOfMemory {
                    requested: required,
                    remaining,
                });
            }
            let new_used = current + required;
            if header
                .used_offset
                .compare_exchange(current, new_used, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break current;
            }
        };

        let prev_head = header.hash_bucket[bucket].load(Ordering::Acquire);
        let table_ptr = unsafe { self.base.add(offset as usize) as *mut TableHeader };
        unsafe {
            (*table_ptr).next_offset = prev_head;
            (*table_ptr).size = required;
            (*table_ptr).name = name_buf;
            (*table_ptr).record_size = record_size;
            (*table_ptr).count = count as u64;
        }
        header.hash_bucket[bucket].store(offset, Ordering::Release);

        let records = unsafe { table_ptr.add(1) as *mut T };
        for i in 0..count {
            unsafe { records.add(i).write(std::mem::zeroed::<T>()) };
        }

        Ok(TableHandle {
            ptr: records,
            count,
            _marker: PhantomData,
        })
    }

    /// Ouvre une table déjà créée (par le même process, ou par un autre process
    /// ayant ouvert l'arène en lecture).
    pub fn open_table<T: Copy>(&self, name: &str) -> Result<TableHandle<T>, ArenaError> {
        let bucket = hash_name(name);
        let header = self.header();
        let mut cursor = header.hash_bucket[bucket].load(Ordering::Acquire);
        while cursor != 0 {
            let table = unsafe { &*(self.base.add(cursor as usize) as *const TableHeader) };
            if decode_name(&table.name) == name {
                let expected = size_of::<T>() as u64;
                if table.record_size != expected {
                    return Err(ArenaError::LayoutMismatch {
                        name: name.to_string(),
                        stored: table.record_size,
                        requested: expected,
                    });
                }
                let records = unsafe {
                    (self.base.add(cursor as usize) as *mut TableHeader).add(1) as *mut T
                };
                return Ok(TableHandle {
                    ptr: records,
                    count: table.count as usize,
                    _marker: PhantomData,
                });
            }
            cursor = table.next_offset;
        }
        Err(ArenaError::NotFound(name.to_string()))
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut c_void, self.len) };
        if self.owner {
            unsafe { shm_unlink(self.path.as_ptr()) };
        }
    }
}

/// Poignée typée sur une table de l'arène. Bon marché à copier (c'est un
/// simple pointeur + taille); la durée de vie réelle est celle de l'arène
/// sous-jacente, que l'appelant doit garder vivante.
pub struct TableHandle<T> {
    ptr: *mut T,
    count: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for TableHandle<T> {}
unsafe impl<T: Sync> Sync for TableHandle<T> {}

impl<T: Copy> TableHandle<T> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: usize) -> Option<T> {
        if index >= self.count {
            return None;
        }
        Some(unsafe { std::ptr::read_volatile(self.ptr.add(index)) })
    }

    pub fn set(&self, index: usize, value: T) -> bool {
        if index >= self.count {
            return false;
        }
        unsafe { std::ptr::write_volatile(self.ptr.add(index), value) };
        true
    }
}

impl<T> Clone for TableHandle<T> {
    fn clone(&self) -> Self {
        TableHandle {
            ptr: self.ptr,
            count: self.count,
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct Dummy {
        a: i64,
        b: u32,
    }

    #[test]
    fn test_create_and_roundtrip() {
        let name = format!("housetime-test-{}", std::process::id());
        let arena = SharedArena::create(&name, 64 * 1024).unwrap();
        let table = arena.create_table::<Dummy>("dummy", 4).unwrap();
        assert_eq!(table.len(), 4);
        assert!(table.set(0, Dummy { a: 42, b: 7 }));
        let read_back = table.get(0).unwrap();
        assert_eq!(read_back.a, 42);
        assert_eq!(read_back.b, 7);
        assert_eq!(table.get(4), None);
    }

    #[test]
    fn test_duplicate_table_name_rejected() {
        let name = format!("housetime-test-dup-{}", std::process::id());
        let arena = SharedArena::create(&name, 64 * 1024).unwrap();
        arena.create_table::<Dummy>("dummy", 1).unwrap();
        let err = arena.create_table::<Dummy>("dummy", 1).unwrap_err();
        assert!(matches!(err, ArenaError::AlreadyExists(_)));
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let name = format!("housetime-test-layout-{}", std::process::id());
        let arena = SharedArena::create(&name, 64 * 1024).unwrap();
        arena.create_table::<Dummy>("dummy", 1).unwrap();
        let err = arena.open_table::<u8>("dummy").unwrap_err();
        assert!(matches!(err, ArenaError::LayoutMismatch { .. }));
    }

    #[test]
    fn test_out_of_memory() {
        let name = format!("housetime-test-oom-{}", std::process::id());
        let arena = SharedArena::create(&name, 256).unwrap();
        let err = arena.create_table::<Dummy>("big", 1000).unwrap_err();
        assert!(matches!(err, ArenaError::OutOfMemory { .. }));
    }
}
