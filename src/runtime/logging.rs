// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::Logger;
use ::std::{
    env,
    mem,
    sync::Once,
};

//==============================================================================
// Constants
//==============================================================================

/// Environment variable naming the log specification for the runtime.
const LOG_ENV_VAR: &str = "TASKRING_LOG";

/// Specification used when neither `TASKRING_LOG` nor `RUST_LOG` is set.
/// Warnings only, so the scheduling and worker spin loops stay quiet.
const DEFAULT_LOG_SPEC: &str = "warn";

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features. The specification is read from
/// `TASKRING_LOG`, falling back to `RUST_LOG`. A malformed specification
/// leaves logging disabled rather than aborting the orchestration.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        let spec: String = env::var(LOG_ENV_VAR)
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| String::from(DEFAULT_LOG_SPEC));
        if let Ok(handle) = Logger::try_with_str(&spec).and_then(|logger| logger.start()) {
            // The writer must outlive every core that logs.
            mem::forget(handle);
        }
    });
}

//==============================================================================
// Unit Tests
//==============================================================================
