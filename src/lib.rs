// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

pub mod assets;
pub mod batch;
pub mod db;
pub mod filter;
pub mod frame;
pub mod logs;
pub mod openai;
pub mod progress;
pub mod proxy;
pub mod settings;
pub mod transcode;
pub mod upstream;
