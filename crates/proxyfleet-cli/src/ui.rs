use colored::Colorize;

fn prefix() -> String {
    "[proxyfleet]".bold().cyan().to_string()
}

/// Print an informational message: [proxyfleet] message
pub fn info(msg: &str) {
    println!("{} {}", prefix(), msg);
}

/// Print a success message in green.
pub fn success(msg: &str) {
    println!("{} {}", prefix(), msg.green());
}

/// Print a warning in yellow.
pub fn warn(msg: &str) {
    println!("{} {}", prefix(), msg.yellow());
}

/// Print an error to stderr in red.
pub fn error(msg: &str) {
    eprintln!("{} {}", "[proxyfleet]".bold().red(), msg.red());
}
