#[tokio::main]
async fn main() {
    if let Err(e) = chatcall_lib::run().await {
        eprintln!("chatcall: {}", e.user_message());
        std::process::exit(1);
    }
}
