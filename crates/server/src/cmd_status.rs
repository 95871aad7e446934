//! `fleetdock status`: check if the server is running.

use std::path::Path;
use std::time::Duration;

use fleetdock_protocol::{ControlCommand, ControlRequest};

use crate::control;
use crate::paths;
use crate::VERSION;

pub async fn run(data_dir: &Path, socket: &Path) -> anyhow::Result<()> {
    println!();
    println!("  fleetdock v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    // Check PID file
    let pid_path = paths::pid_file_path();
    let pid_alive = if pid_path.exists() {
        let pid_str = std::fs::read_to_string(&pid_path).unwrap_or_default();
        let pid: u32 = pid_str.trim().parse().unwrap_or(0);
        if pid > 0 && process_alive(pid) {
            println!("  PID: {} (running)", pid);
            true
        } else {
            println!("  PID file: {} (stale, process not found)", pid);
            false
        }
    } else {
        println!("  PID file: not found");
        false
    };

    // Ping the control socket
    let ping = ControlRequest {
        id: None,
        command: ControlCommand::Ping,
    };
    let socket_ok = match control::request(socket, &ping, Duration::from_secs(2)).await {
        Ok(response) if response.ok => {
            println!("  Control socket: OK ({})", socket.display());
            true
        }
        Ok(response) => {
            println!(
                "  Control socket: error ({})",
                response.error.unwrap_or_default()
            );
            false
        }
        Err(_) if pid_alive => {
            println!("  Control socket: unreachable (server may be using a different data dir)");
            false
        }
        Err(_) => {
            println!("  Control socket: unreachable");
            false
        }
    };

    // DB size
    let db_path = paths::db_path();
    if db_path.exists() {
        let size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
        println!("  Database: {} ({} KB)", db_path.display(), size / 1024);
    } else {
        println!("  Database: not found");
    }

    println!();

    if !pid_alive && !socket_ok {
        println!("  Server is not running.");
        println!("  Start with: fleetdock start");
    }

    println!();
    Ok(())
}

fn process_alive(pid: u32) -> bool {
    // kill -0 checks if process exists without sending a signal
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
