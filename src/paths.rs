//! Path utilities and file system helpers

use std::path::PathBuf;

/// Name of the main screenshot queue directory
pub const MAIN_QUEUE: &str = "main";

/// Name of the debug screenshot queue directory
pub const DEBUG_QUEUE: &str = "debug";

/// Gets the application data directory
pub fn get_app_data_dir() -> Result<PathBuf, String> {
    dirs::data_dir()
        .map(|p| p.join("com.snapsolve.desktop"))
        .ok_or_else(|| "Could not find app data directory".to_string())
}

/// Clears all application data
pub fn clear_app_data() -> Result<(), String> {
    let app_dir = get_app_data_dir()?;
    if app_dir.exists() {
        std::fs::remove_dir_all(&app_dir)
            .map_err(|e| format!("Failed to clear app data: {}", e))?;
    }
    Ok(())
}

/// Gets the screenshots root directory path
pub fn get_screenshots_dir() -> Result<PathBuf, String> {
    get_app_data_dir().map(|p| p.join("Screenshots"))
}

/// Gets the directory backing a named screenshot queue
pub fn get_queue_dir(queue: &str) -> Result<PathBuf, String> {
    get_screenshots_dir().map(|p| p.join(queue))
}

/// Gets the history database file path
pub fn get_db_path() -> Result<PathBuf, String> {
    get_app_data_dir().map(|p| p.join("solve_history.db"))
}

/// Gets the AI model configuration file path
pub fn get_config_path() -> Result<PathBuf, String> {
    get_app_data_dir().map(|p| p.join(".ai_models.json"))
}
