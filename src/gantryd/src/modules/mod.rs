// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

pub mod line;
pub mod passthrough;
