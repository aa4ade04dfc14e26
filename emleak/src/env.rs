//! Utilities for inspecting and controlling the state of the current process
//! and the host it runs on.
//!
//! Measurement fidelity assumes the target runs alone on an isolated core.
//! None of this is enforced; these helpers only report what the host
//! currently looks like.

use crate::error::*;
use std::io;
use std::path::Path;

pub struct TargetEnv;
impl TargetEnv {
    const ISOLATED_PATH: &'static str =
        "/sys/devices/system/cpu/isolated";
    const NOHZ_PATH: &'static str =
        "/sys/devices/system/cpu/nohz_full";
    const GPIOMEM_PATH: &'static str = "/dev/gpiomem";

    fn read_trimmed(path: impl AsRef<Path>) -> io::Result<String> {
        Ok(std::fs::read_to_string(path)?.trim().to_string())
    }

    /// Return a string describing a cpu list from sysfs.
    fn cpu_list(path: &str) -> io::Result<String> {
        let res = Self::read_trimmed(path)?;
        match res.as_str() {
            "" => Ok("disabled".to_string()),
            _ => Ok(res),
        }
    }

    /// Return a string describing the set of isolated cores.
    pub fn sysfs_isolated() -> io::Result<String> {
        Self::cpu_list(Self::ISOLATED_PATH)
    }

    /// Return a string describing the set of 'nohz_full' cores.
    pub fn sysfs_nohz() -> io::Result<String> {
        Self::cpu_list(Self::NOHZ_PATH)
    }

    /// Return a string describing the cpufreq scaling strategy for a
    /// particular core.
    pub fn sysfs_cpufreq_governor(n: usize) -> io::Result<String> {
        Self::read_trimmed(format!(
            "/sys/devices/system/cpu/cpu{}/cpufreq/scaling_governor", n
        ))
    }

    /// Number of online cores.
    pub fn online_cores() -> Option<usize> {
        nix::unistd::sysconf(nix::unistd::SysconfVar::_NPROCESSORS_ONLN)
            .ok()
            .flatten()
            .map(|n| n as usize)
    }

    /// Returns `Ok(())` when the GPIO register window can be opened
    /// read/write by this process.
    pub fn gpiomem_accessible() -> io::Result<()> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::GPIOMEM_PATH)
            .map(|_| ())
    }

    /// Pin the current process to a particular core.
    pub fn pin_to_core(core: usize) -> TargetResult<()> {
        let this_pid = nix::unistd::Pid::from_raw(0);
        let mut cpuset = nix::sched::CpuSet::new();
        cpuset.set(core).map_err(|source| TargetError::Pinning { core, source })?;
        nix::sched::sched_setaffinity(this_pid, &cpuset)
            .map_err(|source| TargetError::Pinning { core, source })
    }

    /// The set of cores the current process may run on.
    pub fn affinity() -> nix::Result<Vec<usize>> {
        let this_pid = nix::unistd::Pid::from_raw(0);
        let cpuset = nix::sched::sched_getaffinity(this_pid)?;
        Ok((0..nix::sched::CpuSet::count())
            .filter(|i| cpuset.is_set(*i).unwrap_or(false))
            .collect())
    }
}
