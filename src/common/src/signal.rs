// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// Control-plane messages fanned out to every worker thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting, drain and exit the event loop.
    Shutdown,
}
