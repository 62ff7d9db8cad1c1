//! Словарь меток для целевой последовательности.
//!
//! Словарь строится и сохраняется внешним инструментом в виде JSON-объекта
//! `{ "токен": индекс }`. Здесь он только читается: модели нужен размер
//! словаря и индекс PAD.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::{AsrError, AsrResult};

/// Токен заполнения (PAD).
pub const PAD_WORD: &str = "<blank>";
/// Неизвестный токен.
pub const UNK_WORD: &str = "<unk>";
/// Начало последовательности.
pub const BOS_WORD: &str = "<s>";
/// Конец последовательности.
pub const EOS_WORD: &str = "</s>";

/// Индекс PAD по умолчанию.
pub const PAD: u32 = 0;
pub const UNK: u32 = 1;
pub const BOS: u32 = 2;
pub const EOS: u32 = 3;

/// Двунаправленное отображение токен ↔ индекс.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    id_to_token: Vec<Option<String>>,
    token_to_id: HashMap<String, u32>,
    pad_index: u32,
}

impl Vocabulary {
    /// Собрать словарь из готового отображения `токен -> индекс`.
    ///
    /// Отображение обязано содержать [`PAD_WORD`].
    pub fn from_map(token_to_id: HashMap<String, u32>) -> AsrResult<Self> {
        if token_to_id.is_empty() {
            return Err(AsrError::config("словарь пуст"));
        }
        let pad_index = *token_to_id
            .get(PAD_WORD)
            .ok_or_else(|| AsrError::config(format!("в словаре нет токена {PAD_WORD}")))?;

        let max_id = token_to_id.values().copied().max().unwrap_or(0);
        let mut id_to_token: Vec<Option<String>> = vec![None; max_id as usize + 1];
        for (token, &id) in &token_to_id {
            if let Some(existing) = &id_to_token[id as usize] {
                return Err(AsrError::config(format!(
                    "индекс {id} назначен двум токенам: {existing} и {token}"
                )));
            }
            id_to_token[id as usize] = Some(token.clone());
        }

        Ok(Self {
            id_to_token,
            token_to_id,
            pad_index,
        })
    }

    /// Загрузить словарь из JSON-файла.
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let map: HashMap<String, u32> = serde_json::from_str(&content)?;
        let vocab = Self::from_map(map)?;
        debug!(
            "Словарь загружен из {:?}: {} токенов, PAD={}",
            path,
            vocab.len(),
            vocab.pad_index
        );
        Ok(vocab)
    }

    /// Размер словаря (максимальный индекс + 1), т.е. ширина выходных логитов.
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn pad_index(&self) -> u32 {
        self.pad_index
    }

    /// Индекс токена, если он есть в словаре.
    pub fn index(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Токен по индексу (None для «дырок» в нумерации).
    pub fn token(&self, index: u32) -> Option<&str> {
        self.id_to_token
            .get(index as usize)
            .and_then(|t| t.as_deref())
    }

    /// Перевести последовательность токенов в индексы (неизвестные → `<unk>`).
    pub fn encode<'a>(&self, tokens: impl IntoIterator<Item = &'a str>) -> Vec<u32> {
        let unk = self.index(UNK_WORD).unwrap_or(UNK);
        tokens
            .into_iter()
            .map(|t| self.index(t).unwrap_or(unk))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> HashMap<String, u32> {
        [
            (PAD_WORD, PAD),
            (UNK_WORD, UNK),
            (BOS_WORD, BOS),
            (EOS_WORD, EOS),
            ("a", 4),
            ("b", 5),
        ]
        .into_iter()
        .map(|(t, i)| (t.to_string(), i))
        .collect()
    }

    #[test]
    fn test_from_map() {
        let vocab = Vocabulary::from_map(sample_map()).unwrap();
        assert_eq!(vocab.len(), 6);
        assert_eq!(vocab.pad_index(), PAD);
        assert_eq!(vocab.index("b"), Some(5));
        assert_eq!(vocab.token(4), Some("a"));
        assert_eq!(vocab.token(99), None);
    }

    #[test]
    fn test_encode_unknown() {
        let vocab = Vocabulary::from_map(sample_map()).unwrap();
        assert_eq!(vocab.encode(["a", "zzz", "b"]), vec![4, UNK, 5]);
    }

    #[test]
    fn test_missing_pad_rejected() {
        let mut map = sample_map();
        map.remove(PAD_WORD);
        assert!(matches!(
            Vocabulary::from_map(map),
            Err(AsrError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let mut map = sample_map();
        map.insert("c".to_string(), 5);
        assert!(Vocabulary::from_map(map).is_err());
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("rustasr-vocab-{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_string(&sample_map()).unwrap()).unwrap();
        let vocab = Vocabulary::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(vocab.len(), 6);
    }
}
