fn main() {
    if let Err(e) = zenflow_lib::run() {
        eprintln!("zenflow-voice: {}", e);
        std::process::exit(1);
    }
}
