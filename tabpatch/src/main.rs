// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::error;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Ctrl-C sets the returned flag. Running tasks stop at the next partition or
/// chunk boundary and drop their staging directories.
fn cancel_on_interrupt() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let cancel_signal = Arc::new(AtomicBool::new(false));
    let signal = cancel_signal.clone();

    ctrlc::set_handler(move || {
        signal.store(true, Ordering::SeqCst);
    })?;

    Ok(cancel_signal)
}

fn main() -> ExitCode {
    let cancel_signal = match cancel_on_interrupt() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to set signal handler: {e}");
            return ExitCode::FAILURE;
        }
    };

    match tabpatch::cli::args::main(&LOGGING_INITIALIZED, &cancel_signal) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
                error!("{e:?}");
            } else {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
