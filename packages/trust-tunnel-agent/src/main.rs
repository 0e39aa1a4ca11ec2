fn main() {
    if let Err(err) = trust_tunnel_agent::cli::run_agent() {
        tracing::error!(error = %err, "trust-tunnel-agent failed");
        std::process::exit(1);
    }
}
