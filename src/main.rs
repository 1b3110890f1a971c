fn main() {
    if let Err(err) = saved_gallery::run() {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
