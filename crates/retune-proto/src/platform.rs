use std::path::PathBuf;

pub const CONTROL_TCP_PORT: u16 = 9921;
pub const RELAY_PORT: u16 = 9923;

const CONTROL_TCP_HOST: &str = "127.0.0.1";

pub fn control_address() -> String {
    format!("{}:{}", CONTROL_TCP_HOST, CONTROL_TCP_PORT)
}

/// Base URL of the local relay, as handed to the player.
pub fn relay_base(port: u16) -> String {
    format!("http://{}:{}", CONTROL_TCP_HOST, port)
}

#[cfg(unix)]
pub fn player_socket_name() -> String {
    format!("{}/retune-mpv.sock", std::env::temp_dir().display())
}

#[cfg(windows)]
pub fn player_socket_name() -> String {
    "retune-mpv".to_string()
}

#[cfg(unix)]
pub fn player_socket_arg() -> String {
    format!("--input-ipc-server={}", player_socket_name())
}

#[cfg(windows)]
pub fn player_socket_arg() -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", player_socket_name())
}

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/retune/ (XDG standard)
    // instead of macOS Application Support for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("retune")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("retune")
    }
}

pub fn config_dir() -> PathBuf {
    // On macOS and Linux, always use ~/.config/retune/
    // (avoid macOS Application Support folder for consistency)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("retune")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("retune")
    }
}

#[cfg(unix)]
pub fn player_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn player_binary_name() -> &'static str {
    "mpv.exe"
}

fn find_beside_exe(name: &str) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    let p = dir.join(name);
    if p.exists() {
        return Some(p);
    }
    let p = dir.join("external").join(name);
    if p.exists() {
        return Some(p);
    }
    None
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    for dir in path.split(sep) {
        let p = PathBuf::from(dir).join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

/// Find the mpv binary: beside the current exe (bundled distribution),
/// then PATH.
pub fn find_player_binary() -> Option<PathBuf> {
    let name = player_binary_name();
    if let Some(p) = find_beside_exe(name) {
        return Some(p);
    }
    find_on_path(name)
}
