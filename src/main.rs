//! mipack - meta-installer assembly pipeline.
//!
//! This binary assembles self-extracting installers from a bundle catalog:
//! payload packaging, resource embedding, offline manifests, signing, and
//! certificate tagging.

use mipack::cli;
use mipack::cli::Console;
use std::process;

#[tokio::main]
async fn main() {
    env_logger::init();

    match cli::run().await {
        Ok(exit_code) => {
            process::exit(exit_code);
        }
        Err(e) => {
            // Never quiet for fatal errors.
            let console = Console::new(false);
            console.error(&format!("Fatal error: {e}"));

            let suggestions = e.recovery_suggestions();
            if !suggestions.is_empty() {
                let _ = console.println("\nRecovery suggestions:");
                for suggestion in suggestions {
                    let _ = console.indent(&suggestion);
                }
            }

            process::exit(1);
        }
    }
}
