/// What paging needs from the thread scheduler: a way to give up the CPU
/// while another thread holds a frame pin or the swap device.
pub trait Scheduler: Send + Sync {
    fn yield_now(&self);
}

/// Yields to the host's thread scheduler.
#[cfg(not(target_os = "none"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadYield;

#[cfg(not(target_os = "none"))]
impl Scheduler for ThreadYield {
    fn yield_now(&self) {
        std::thread::yield_now();
    }
}
