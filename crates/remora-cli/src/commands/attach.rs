//! Attach command implementation.

use anyhow::{Result, bail};
#[cfg(target_os = "windows")]
use chrono::Local;
use owo_colors::OwoColorize;
use remora::AttachEvent;

use crate::config::AttachOptions;

/// Run the attach command
pub fn run(options: AttachOptions, once: bool) -> Result<()> {
    if options.session.process_name.is_empty() {
        bail!("No target process given (use --process or set session.process_name in the config)");
    }
    run_live(options, once)
}

#[cfg(target_os = "windows")]
fn run_live(options: AttachOptions, once: bool) -> Result<()> {
    use std::sync::Arc;
    use std::thread;

    use remora::{
        AttachContext, DirectoryResources, ShutdownSignal, SignatureRegistry, Supervisor,
        SystemProcesses,
    };
    use tracing::{info, warn};

    let shutdown = Arc::new(ShutdownSignal::new());
    let shutdown_ctrlc = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping...");
        shutdown_ctrlc.trigger();
    })?;

    let mut context = AttachContext::system(
        SignatureRegistry::new(),
        DirectoryResources::new(&options.resources),
    )?
    .with_signatures_from(&options.session)?;
    context.temp_dir = options.temp_dir;
    if context.registry.is_empty() {
        warn!("No signatures loaded, hooks will not resolve any address");
    }

    let supervisor = Supervisor::new(SystemProcesses, options.session, context);
    let events = supervisor.subscribe();
    let shutdown_events = Arc::clone(&shutdown);
    let printer = thread::spawn(move || {
        for event in events {
            println!("[{}] {}", Local::now().format("%H:%M:%S"), describe(&event));
            if once && !matches!(event, AttachEvent::Attached { .. }) {
                shutdown_events.trigger();
            }
        }
    });

    println!("Waiting for target... (Press Ctrl+C to quit)");
    supervisor.run_with(&shutdown, |session| {
        for (key, address) in session.addresses().addresses() {
            println!("  {:<32} 0x{:X}", key, address.address);
        }
    });

    drop(supervisor);
    if printer.join().is_err() {
        warn!("Event printer panicked");
    }
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn run_live(_options: AttachOptions, _once: bool) -> Result<()> {
    bail!("attach needs a Windows host")
}

fn describe(event: &AttachEvent) -> String {
    match event {
        AttachEvent::Attached {
            pid,
            resolved,
            failed,
        } => {
            let line =
                format!("Attached to pid {pid}: {resolved} addresses resolved, {failed} failed");
            if *failed > 0 {
                line.yellow().to_string()
            } else {
                line.green().to_string()
            }
        }
        AttachEvent::Detached { pid } => format!("Detached from pid {pid}"),
        AttachEvent::AttachFailed { reason } => format!("{} {reason}", "Attach failed:".red()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_mentions_pid() {
        let text = describe(&AttachEvent::Detached { pid: 77 });
        assert_eq!(text, "Detached from pid 77");
        let text = describe(&AttachEvent::Attached {
            pid: 5,
            resolved: 2,
            failed: 0,
        });
        assert!(text.contains("pid 5: 2 addresses resolved"));
    }

    #[test]
    fn test_missing_process_name_fails_early() {
        let options = crate::config::CliConfig::default().merge(None, None, None, false);
        let err = run(options, true).unwrap_err();
        assert!(err.to_string().contains("No target process"));
    }
}
