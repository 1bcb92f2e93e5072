//! Zero-downtime upgrade handoff.
//!
//! On `SIGUSR2` the process serializes every registered session's essential
//! state plus its two socket descriptors (close-on-exec cleared) into a
//! sidecar file, then re-execs its own binary with `--runtime=` pointing at
//! that file. The replacement process rebuilds the sessions from the
//! inherited descriptors and resumes proxying. Sessions still mid-handshake
//! are not preserved; bytes sitting in a reader buffer at the moment of
//! upgrade are lost, which is tolerated.

use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::error::{Result, SwitcherError};
use crate::manager::SessionManager;
use crate::protocol::rpc::Request;

pub const RUNTIME_FILE_PATH: &str = "./runtime.json";

/// Serialized per-session state. Field names are part of the sidecar file
/// contract shared with earlier builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionData {
    #[serde(rename = "SessionID")]
    pub session_id: u32,
    pub mining_coin: String,
    #[serde(rename = "ClientConnFD")]
    pub client_conn_fd: RawFd,
    #[serde(rename = "ServerConnFD")]
    pub server_conn_fd: RawFd,
    pub stratum_subscribe_request: Option<Request>,
    pub stratum_authorize_request: Option<Request>,
    #[serde(default, skip_serializing_if = "version_mask_is_zero")]
    pub version_mask: u32,
}

fn version_mask_is_zero(mask: &u32) -> bool {
    *mask == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeData {
    pub action: String,
    #[serde(rename = "ServerID")]
    pub server_id: u8,
    #[serde(default)]
    pub session_datas: Vec<SessionData>,
}

impl RuntimeData {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read(path)?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Installs the `SIGUSR2` handler that triggers the handoff.
pub fn spawn_signal_handler(manager: Arc<SessionManager>) {
    tokio::spawn(async move {
        let mut usr2 = match signal(SignalKind::user_defined2()) {
            Ok(signal) => signal,
            Err(e) => {
                error!("install SIGUSR2 handler failed: {}", e);
                return;
            }
        };
        while usr2.recv().await.is_some() {
            if let Err(e) = upgrade_stratum_switcher(&manager).await {
                error!("upgrade failed: {}", e);
            }
        }
    });
}

async fn upgrade_stratum_switcher(manager: &Arc<SessionManager>) -> Result<()> {
    info!("upgrading...");

    let mut runtime = RuntimeData {
        action: "upgrade".to_string(),
        server_id: manager.server_id(),
        session_datas: Vec::new(),
    };

    for session in manager.session_list() {
        let st = session.state.lock().await;
        let Some(server) = st.server.as_ref() else {
            continue;
        };

        let client_conn_fd = session.client.as_raw_fd();
        let server_conn_fd = server.as_raw_fd();
        set_no_close_on_exec(client_conn_fd)?;
        set_no_close_on_exec(server_conn_fd)?;

        runtime.session_datas.push(SessionData {
            session_id: session.session_id(),
            mining_coin: st.mining_coin.clone(),
            client_conn_fd,
            server_conn_fd,
            stratum_subscribe_request: st.subscribe_request.clone(),
            stratum_authorize_request: st.authorize_request.clone(),
            version_mask: st.version_mask,
        });
    }

    runtime.save_to_file(RUNTIME_FILE_PATH)?;
    info!(
        "runtime data saved, {} sessions to hand over",
        runtime.session_datas.len()
    );

    // The coordinator socket keeps its close-on-exec flag, so the exec drops
    // it and the ephemeral server-ID lease expires with the old session.
    exec_replacement()
}

fn set_no_close_on_exec(fd: RawFd) -> Result<()> {
    // SAFETY: plain fcntl flag manipulation on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Re-execs the current binary with the original arguments, swapping in the
/// fresh `--runtime=` flag. Only returns on failure.
fn exec_replacement() -> Result<()> {
    let mut args_iter = std::env::args();
    let exe = args_iter
        .next()
        .ok_or_else(|| SwitcherError::Config("missing argv[0]".into()))?;

    let mut args: Vec<String> = Vec::new();
    let mut skip_next = false;
    for arg in args_iter {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "--runtime" {
            skip_next = true;
            continue;
        }
        if arg.starts_with("--runtime=") {
            continue;
        }
        args.push(arg);
    }
    args.push(format!("--runtime={RUNTIME_FILE_PATH}"));

    info!("exec {} {:?}", exe, args);
    let err = Command::new(&exe).args(&args).exec();
    Err(err.into())
}
