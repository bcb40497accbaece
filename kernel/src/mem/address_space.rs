use super::page_table::SupplementalPageTable;
use super::Pid;
use crate::paging::{PageDirectory, PageMapping};
use crate::sync::Mutex;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// The paging state of one process.
pub struct AddressSpace {
    pid: Pid,
    pagedir: Box<dyn PageMapping>,
    pages: SupplementalPageTable,
}

impl AddressSpace {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            pagedir: Box::new(PageDirectory::new()),
            pages: SupplementalPageTable::new(pid),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pagedir(&self) -> &dyn PageMapping {
        &*self.pagedir
    }

    pub fn pages(&self) -> &SupplementalPageTable {
        &self.pages
    }
}

/// Address spaces of all live processes.
#[derive(Default)]
pub struct AddressSpaceTable {
    table: Mutex<BTreeMap<Pid, Arc<AddressSpace>>>,
}

impl AddressSpaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, space: Arc<AddressSpace>) {
        let mut table = self.table.lock();
        assert!(
            !table.contains_key(&space.pid),
            "address space of pid {} already added",
            space.pid
        );
        table.insert(space.pid, space);
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<AddressSpace>> {
        self.table.lock().remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<AddressSpace>> {
        self.table.lock().get(&pid).cloned()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.table.lock().keys().copied().collect()
    }
}
