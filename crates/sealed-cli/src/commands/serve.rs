use sealed_server::{ServerOptions, run_server};

pub fn run(host: &str, port: u16, max_length: usize) {
    let base = format!("http://{host}:{port}");

    println!("Sealed Envelope entropy proxy v{}", sealed_core::VERSION);
    println!("   {base}");
    println!("   source: {}", sealed_server::SERVED_SOURCE);
    println!();
    println!("   Endpoints:");
    println!("     GET /                 API index (try: curl {base})");
    println!("     GET /api/v1/bytes     Raw bytes (length=1..{max_length})");
    println!("     GET /health           Counters");
    println!();
    println!("   Use it as a proxy source:");
    println!("     sealed fetch --source hardware-proxy --endpoint {base}/api/v1/bytes --bytes 32");
    println!();

    let rt = super::runtime();
    if let Err(e) = rt.block_on(run_server(host, port, ServerOptions { max_length })) {
        eprintln!("Server failed: {e}");
        std::process::exit(1);
    }
}
