use colored::Colorize;

fn main() {
    if let Err(err) = taucmdr::run() {
        eprintln!("{} {}", "✗".bright_red().bold(), err);
        for hint in err.hints() {
            eprintln!("  {} {}", "▸".bright_yellow(), hint);
        }
        std::process::exit(1);
    }
}
