use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Reserved identity of the mount root. It never enters the table and
/// ignores forgets.
pub const ROOT_INO: u64 = 1;

const FIRST_INO: u64 = 2;

/// One interned inode: a container-relative path plus the view it was
/// reached through. The empty path names the view root itself.
#[derive(Debug)]
pub struct Inode {
    pub ino: u64,
    pub path: String,
    pub raw: bool,
    refcount: AtomicU64,
}

impl Inode {
    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Table {
    by_key: HashMap<(String, bool), u64>,
    by_ino: HashMap<u64, Arc<Inode>>,
    next_ino: u64,
}

/// Interning table mapping (path, view) to reference-counted inodes. The
/// kernel's fixed-width inode id is the handle; two lookups of the same
/// path through the same view always produce the same id.
pub struct InodeTable {
    table: Mutex<Table>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                by_key: HashMap::new(),
                by_ino: HashMap::new(),
                next_ino: FIRST_INO,
            }),
        }
    }

    /// Return the live inode for (path, raw) with its refcount bumped, or
    /// insert a fresh one with refcount 1.
    pub fn intern(&self, path: String, raw: bool) -> Arc<Inode> {
        let mut table = self.table.lock().unwrap();
        let table = &mut *table;
        match table.by_key.entry((path, raw)) {
            Entry::Occupied(occupied) => {
                let inode = table.by_ino[occupied.get()].clone();
                inode.refcount.fetch_add(1, Ordering::SeqCst);
                inode
            }
            Entry::Vacant(vacant) => {
                let ino = table.next_ino;
                table.next_ino += 1;
                let inode = Arc::new(Inode {
                    ino,
                    path: vacant.key().0.clone(),
                    raw,
                    refcount: AtomicU64::new(1),
                });
                vacant.insert(ino);
                table.by_ino.insert(ino, inode.clone());
                inode
            }
        }
    }

    pub fn get(&self, ino: u64) -> Option<Arc<Inode>> {
        self.table.lock().unwrap().by_ino.get(&ino).cloned()
    }

    /// Subtract `count` lookups; the entry is dropped when its refcount
    /// reaches zero. The decrement happens under the table lock so a
    /// concurrent intern cannot resurrect an entry that is going away.
    pub fn forget(&self, ino: u64, count: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut table = self.table.lock().unwrap();
        let Some(inode) = table.by_ino.get(&ino).cloned() else {
            return;
        };
        let previous = inode.refcount.fetch_sub(count, Ordering::SeqCst);
        if previous <= count {
            table.by_ino.remove(&ino);
            table.by_key.remove(&(inode.path.clone(), inode.raw));
        }
    }

    pub fn forget_multi(&self, requests: &[(u64, u64)]) {
        for &(ino, count) in requests {
            self.forget(ino, count);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().unwrap().by_ino.len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let table = InodeTable::new();
        let first = table.intern("bin/ls".into(), false);
        let second = table.intern("bin/ls".into(), false);
        assert_eq!(first.ino, second.ino);
        assert_eq!(first.refcount(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn views_do_not_alias() {
        let table = InodeTable::new();
        let exe = table.intern("bin/ls".into(), false);
        let raw = table.intern("bin/ls".into(), true);
        assert_ne!(exe.ino, raw.ino);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn forget_drops_at_zero() {
        let table = InodeTable::new();
        let inode = table.intern("etc/motd".into(), true);
        table.intern("etc/motd".into(), true);

        table.forget(inode.ino, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(inode.ino).unwrap().refcount(), 1);

        table.forget(inode.ino, 1);
        assert_eq!(table.len(), 0);
        assert!(table.get(inode.ino).is_none());

        // a fresh intern of the same key gets a new id
        let again = table.intern("etc/motd".into(), true);
        assert_ne!(again.ino, inode.ino);
    }

    #[test]
    fn forget_multi_matches_looping() {
        let table = InodeTable::new();
        let a = table.intern("a".into(), false);
        let b = table.intern("b".into(), false);
        table.intern("b".into(), false);

        table.forget_multi(&[(a.ino, 1), (b.ino, 2)]);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn root_ignores_forget() {
        let table = InodeTable::new();
        table.forget(ROOT_INO, 100);
        let inode = table.intern("".into(), false);
        assert_ne!(inode.ino, ROOT_INO);
    }
}
