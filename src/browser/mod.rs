//! 浏览器层
//!
//! - `launcher` - 启动器接口
//! - `chrome` - 基于本机 Chromium 系浏览器的启动器
//! - `connection` - 调试地址探测

pub mod chrome;
pub mod connection;
pub mod launcher;

pub use chrome::ChromeLauncher;
pub use connection::probe_endpoint;
pub use launcher::{BrowserLauncher, LaunchOptions, LaunchedBrowser};
