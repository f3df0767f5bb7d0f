// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (WebSocket frames, shell output chunks)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    if let Err(e) = shellbridge::run().await {
        eprintln!("shellbridge: {}", e);
        std::process::exit(1);
    }
}
