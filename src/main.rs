use clap::Parser;
use warden::cli::{output::print_error, Cli};

fn main() {
    // Usage errors exit with 1; 2 and 3 are reserved for spawn and config failures
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = cli.execute() {
        print_error(&e.to_string());
        std::process::exit(e.exit_code());
    }
}
