fn main() {
    condense::env_loader::load_dotenv();

    if let Err(err) = condense::cli::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
