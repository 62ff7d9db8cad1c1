//! Отладочный вывод форм тензоров.
//!
//! Включается переменной окружения `RUSTASR_DEBUG` (любое непустое значение).

use candle_core::Tensor;
use std::sync::OnceLock;

fn flag(value: Option<std::ffi::OsString>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

/// Возвращает `true`, если включен подробный отладочный вывод.
pub fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| flag(std::env::var_os("RUSTASR_DEBUG")))
}

/// Печатает в stderr форму и dtype тензора, если отладка включена.
pub fn dump(label: &str, tensor: &Tensor) {
    if enabled() {
        eprintln!(
            "DEBUG {label}: shape={:?} dtype={:?}",
            tensor.dims(),
            tensor.dtype()
        );
    }
}
