// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod policy;
pub mod registry;
pub mod tool;

pub use policy::{Decision, PermissionOracle};
pub use registry::{logging_middleware, Middleware, Next, RegistryError, ToolRegistry, ToolSchema};
pub use tool::{Tool, ToolCall, ToolOutput};

pub use builtin::apply_patch::ApplyPatchTool;
pub use builtin::edit_file::EditFileTool;
pub use builtin::grep::GrepTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::run_command::RunCommandTool;
pub use builtin::web_fetch::WebFetchTool;
pub use builtin::write::WriteTool;
