use clap::Parser;

fn main() {
    let cli = podtube::Cli::parse();
    if let Err(err) = podtube::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
