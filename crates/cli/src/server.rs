//! Turning a server path into a launch command.

use mcp::ServerConfig;
use std::path::Path;
use std::time::Duration;

/// Build the launch config for the server at `path`.
///
/// Python and JavaScript sources run under their interpreters; anything else
/// is executed directly.
pub fn server_config(path: &Path, args: Vec<String>, timeout: Option<Duration>) -> ServerConfig {
    let script = path.to_string_lossy().into_owned();
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.clone());

    let (command, mut launch_args) = match path.extension().and_then(|ext| ext.to_str()) {
        Some("py") => ("python3".to_string(), vec![script]),
        Some("js") => ("node".to_string(), vec![script]),
        _ => (script, Vec::new()),
    };
    launch_args.extend(args);

    let mut config = ServerConfig::new(name, command).args(launch_args);
    config.request_timeout = timeout;
    config
}
