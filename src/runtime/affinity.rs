//! CPU pinning for shard threads.

use std::io;

/// Pin the calling thread to one CPU out of its current affinity mask.
///
/// Shard `n` takes the `n % allowed`-th allowed CPU. Returns the CPU index.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(shard: usize) -> io::Result<usize> {
    let size = std::mem::size_of::<libc::cpu_set_t>();

    // SAFETY: cpu_set_t is plain data and both calls are given its exact size.
    let allowed: Vec<usize> = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, size, &mut set) != 0 {
            return Err(io::Error::last_os_error());
        }
        (0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect()
    };

    if allowed.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no CPU in affinity mask",
        ));
    }
    let cpu = allowed[shard % allowed.len()];

    // SAFETY: cpu comes from the mask above, so it is below CPU_SETSIZE.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, size, &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(cpu)
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_shard: usize) -> io::Result<usize> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "CPU pinning is only supported on Linux",
    ))
}
