use std::ffi::c_void;
use tokio::process::Command;
use tracing::{debug, warn};

use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, TerminateJobObject,
};
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, SetPriorityClass, TerminateProcess,
    ABOVE_NORMAL_PRIORITY_CLASS, CREATE_NEW_PROCESS_GROUP, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_SET_INFORMATION, PROCESS_SET_QUOTA, PROCESS_TERMINATE,
};

use super::SignalOutcome;

const STILL_ACTIVE: u32 = 259;

/// Holds a Windows Job Object handle for process group management.
pub struct ProcessGroupHandle {
    job: *mut c_void,
}

impl Drop for ProcessGroupHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.job);
        }
    }
}

// SAFETY: Job object handles are thread-safe Windows kernel objects.
unsafe impl Send for ProcessGroupHandle {}
unsafe impl Sync for ProcessGroupHandle {}

pub fn configure_process_group(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

pub fn post_spawn_setup(child_pid: Option<u32>) -> Option<ProcessGroupHandle> {
    let pid = child_pid?;
    unsafe {
        let job = CreateJobObjectW(std::ptr::null(), std::ptr::null());
        if job.is_null() {
            warn!("CreateJobObjectW failed");
            return None;
        }

        let proc_handle = OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, 0, pid);
        if proc_handle.is_null() {
            warn!(pid, "OpenProcess failed for job assignment");
            CloseHandle(job);
            return None;
        }

        let result = AssignProcessToJobObject(job, proc_handle);
        CloseHandle(proc_handle);

        if result == 0 {
            warn!(pid, "AssignProcessToJobObject failed");
            CloseHandle(job);
            return None;
        }

        Some(ProcessGroupHandle { job })
    }
}

pub fn request_graceful_exit(pid: u32, _group: bool) -> SignalOutcome {
    if !is_process_alive(pid) {
        return SignalOutcome::Gone;
    }
    unsafe {
        if GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) != 0 {
            debug!(pid, "sent CTRL_BREAK_EVENT");
            SignalOutcome::Sent
        } else {
            SignalOutcome::Failed(std::io::Error::last_os_error().to_string())
        }
    }
}

pub fn force_kill(pid: u32, _group: bool, group_handle: Option<&ProcessGroupHandle>) {
    unsafe {
        if let Some(handle) = group_handle {
            TerminateJobObject(handle.job, 1);
            return;
        }
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            debug!(pid, "OpenProcess failed, process likely gone");
            return;
        }
        TerminateProcess(handle, 1);
        CloseHandle(handle);
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);
        result != 0 && exit_code == STILL_ACTIVE
    }
}

pub fn elevate_priority(pid: u32) -> std::io::Result<()> {
    unsafe {
        let handle = OpenProcess(PROCESS_SET_INFORMATION, 0, pid);
        if handle.is_null() {
            return Err(std::io::Error::last_os_error());
        }
        let ok = SetPriorityClass(handle, ABOVE_NORMAL_PRIORITY_CLASS);
        CloseHandle(handle);
        if ok == 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

pub fn identify_port_owner(_port: u16) -> Option<String> {
    // TODO: implement via GetExtendedTcpTable from Win32_NetworkManagement_IpHelper
    None
}
