//! # asr-core
//!
//! Базовые типы и определения ошибок для RustASR.
//!
//! Этот крейт предоставляет фундаментальные абстракции для остальных
//! крейтов workspace:
//!
//! - Унифицированная обработка ошибок через [`AsrError`]
//! - Словарь меток [`Vocabulary`] (индекс ↔ токен, зарезервированный PAD)
//! - Переключатель подробного отладочного вывода ([`debug::enabled`])

pub mod debug;
pub mod error;
pub mod vocab;

pub use error::{AsrError, AsrResult};
pub use vocab::Vocabulary;
