// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Utilities for testing code that uses `stream_lifecycle` adapters.

mod fake_resource;

pub use fake_resource::*;
