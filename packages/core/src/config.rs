//! Централизованная конфигурация движка OTR
//!
//! Все константы и настройки протокола определены здесь,
//! чтобы избежать хардкода по всему проекту.

use crate::protocol::version::{Version, VersionSet};
use std::sync::OnceLock;

/// Глобальная конфигурация (синглтон)
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

/// Основная структура конфигурации
#[derive(Debug, Clone)]
pub struct Config {
    // ============================================
    // ВЕРСИИ ПРОТОКОЛА
    // ============================================

    /// Версии, которые мы готовы согласовать
    pub allowed_versions: VersionSet,

    // ============================================
    // ПОЛИТИКА
    // ============================================

    /// Не отправлять plaintext: сообщения ставятся в очередь до ENCRYPTED
    pub require_encryption: bool,

    /// Отвечать `?OTR Error:` на нечитаемые data-сообщения
    pub error_on_unreadable: bool,

    /// Раскрывать старые MAC-ключи (deniability)
    pub reveal_mac_keys: bool,

    // ============================================
    // ЛИМИТЫ
    // ============================================

    /// Максимальный размер одной строки транспорта (0 = без фрагментации)
    pub max_fragment_size: usize,

    /// Максимальное количество сообщений в очереди до завершения AKE
    pub max_pending_outgoing: usize,

    /// Максимальное количество фрагментов в одном сообщении
    pub max_fragments: u16,

    /// Сколько инстансов собеседника отслеживать (беседы и недособранные
    /// фрагменты, каждое отдельно)
    pub max_instances: usize,
}

impl Config {
    /// Создать конфигурацию с дефолтными значениями
    pub fn default() -> Self {
        Self {
            allowed_versions: VersionSet::from_versions(&[Version::V2, Version::V3]),

            require_encryption: true,
            error_on_unreadable: true,
            reveal_mac_keys: true,

            max_fragment_size: 0,
            max_pending_outgoing: 100,
            max_fragments: 1000,
            max_instances: 16,
        }
    }

    /// Создать конфигурацию из переменных окружения
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("OTR_MAX_FRAGMENT_SIZE") {
            if let Ok(parsed) = val.parse() {
                config.max_fragment_size = parsed;
            }
        }

        if let Ok(val) = std::env::var("OTR_MAX_PENDING_OUTGOING") {
            if let Ok(parsed) = val.parse() {
                config.max_pending_outgoing = parsed;
            }
        }

        if let Ok(val) = std::env::var("OTR_MAX_INSTANCES") {
            if let Ok(parsed) = val.parse() {
                config.max_instances = parsed;
            }
        }

        if let Ok(val) = std::env::var("OTR_REQUIRE_ENCRYPTION") {
            if let Ok(parsed) = val.parse() {
                config.require_encryption = parsed;
            }
        }

        if let Ok(val) = std::env::var("OTR_ERROR_ON_UNREADABLE") {
            if let Ok(parsed) = val.parse() {
                config.error_on_unreadable = parsed;
            }
        }

        if let Ok(val) = std::env::var("OTR_ALLOW_V2") {
            if let Ok(false) = val.parse::<bool>() {
                config.allowed_versions.remove(Version::V2);
            }
        }

        config
    }

    /// Получить глобальный экземпляр конфигурации
    ///
    /// Автоматически инициализирует конфигурацию со значениями по умолчанию при первом вызове
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(Config::default)
    }

    /// Инициализировать глобальную конфигурацию со значениями по умолчанию
    ///
    /// # Errors
    ///
    /// Возвращает ошибку, если конфигурация уже была инициализирована
    pub fn init() -> Result<(), &'static str> {
        GLOBAL_CONFIG.set(Self::default())
            .map_err(|_| "Config already initialized")
    }

    /// Инициализировать глобальную конфигурацию из переменных окружения
    pub fn init_from_env() -> Result<(), &'static str> {
        GLOBAL_CONFIG.set(Self::from_env())
            .map_err(|_| "Config already initialized")
    }

    /// Инициализировать глобальную конфигурацию с кастомным экземпляром
    pub fn init_with(config: Config) -> Result<(), &'static str> {
        GLOBAL_CONFIG.set(config)
            .map_err(|_| "Config already initialized")
    }
}
