//! Binary entrypoint for `reshard`.

mod app;

fn main() {
    if let Err(err) = app::run() {
        eprintln!("reshard failed: {err}");
        std::process::exit(1);
    }
}
