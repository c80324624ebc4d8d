use mapping_remover::CliOptions;
use std::path::PathBuf;

fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    args.iter()
        .find_map(|a| a.strip_prefix(prefix.as_str()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Usage: mapping-remover [--config=<path>] [--env=<name>]");
        println!("       mapping-remover --write-default-config [--config=<path>]");
        println!("       mapping-remover --tui-smoke[=environments|connecting|lookup|results|confirm|message]");
        return;
    }

    let options = CliOptions {
        config_path: flag_value(&args, "--config").map(PathBuf::from),
        environment: flag_value(&args, "--env"),
    };

    if args.iter().any(|a| a == "--write-default-config") {
        mapping_remover::run_write_default_config(options);
        return;
    }

    // Non-interactive TUI smoke test mode (for automated checks).
    // Renders a single frame for a specific page and exits 0.
    if let Some(arg) = args
        .iter()
        .find(|a| a.as_str() == "--tui-smoke" || a.starts_with("--tui-smoke="))
    {
        let target = arg
            .split_once('=')
            .map(|(_, v)| v.to_string())
            .filter(|v| !v.trim().is_empty());
        mapping_remover::run_tui_smoke(target);
        return;
    }

    mapping_remover::run_tui(options);
}
