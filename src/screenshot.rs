//! Screenshot capture and the bounded rolling queues behind it

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::imageops::FilterType;
use image::GenericImageView;
use log::{info, warn};

use crate::paths::get_queue_dir;

/// Maximum number of screenshots a queue holds before FIFO eviction
pub const MAX_QUEUE_SIZE: usize = 2;

/// Screenshots wider than this are downscaled before being sent to a model
const MAX_PAYLOAD_WIDTH: u32 = 1600;

/// A rolling, disk-backed screenshot queue
pub struct ScreenshotQueue {
    dir: PathBuf,
    capacity: usize,
}

impl ScreenshotQueue {
    /// Opens the named queue under the app data directory
    pub fn open(name: &str) -> Result<Self, String> {
        let dir = get_queue_dir(name)?;
        Ok(Self::at(dir))
    }

    pub fn at(dir: PathBuf) -> Self {
        Self {
            dir,
            capacity: MAX_QUEUE_SIZE,
        }
    }

    /// Lists queued screenshots, oldest first
    pub fn list(&self) -> Result<Vec<PathBuf>, String> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
        let read_dir = std::fs::read_dir(&self.dir)
            .map_err(|e| format!("Failed to read queue directory: {}", e))?;
        for entry in read_dir {
            let entry = entry.map_err(|e| format!("Failed to read queue entry: {}", e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            entries.push((modified, path));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(entries.into_iter().map(|(_, p)| p).collect())
    }

    /// Captures a new screenshot into the queue, evicting the oldest entry
    /// when the queue is full
    pub fn capture(&self) -> Result<PathBuf, String> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| format!("Failed to create queue directory: {}", e))?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| format!("Time error: {}", e))?
            .as_millis();
        let filepath = self.dir.join(format!("{:x}.jpg", timestamp));

        capture_to(&filepath)?;
        info!("captured screenshot to {:?}", filepath);

        for evicted in self.evict_overflow()? {
            info!("evicted oldest screenshot {:?}", evicted);
        }
        Ok(filepath)
    }

    /// Removes entries beyond capacity, oldest first; returns what was evicted
    pub fn evict_overflow(&self) -> Result<Vec<PathBuf>, String> {
        let entries = self.list()?;
        let mut evicted = Vec::new();
        if entries.len() <= self.capacity {
            return Ok(evicted);
        }
        for path in &entries[..entries.len() - self.capacity] {
            std::fs::remove_file(path)
                .map_err(|e| format!("Failed to evict screenshot: {}", e))?;
            evicted.push(path.clone());
        }
        Ok(evicted)
    }

    /// Deletes a single queued screenshot by path
    pub fn delete(&self, path: &Path) -> Result<(), String> {
        if path.parent() != Some(self.dir.as_path()) {
            return Err(format!("Path is not inside this queue: {:?}", path));
        }
        std::fs::remove_file(path).map_err(|e| format!("Failed to delete screenshot: {}", e))
    }

    /// Deletes every queued screenshot
    pub fn clear(&self) -> Result<(), String> {
        for path in self.list()? {
            std::fs::remove_file(&path)
                .map_err(|e| format!("Failed to delete screenshot: {}", e))?;
        }
        Ok(())
    }
}

/// Runs the platform screenshot utility, writing the capture to `filepath`
fn capture_to(filepath: &Path) -> Result<(), String> {
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("screencapture")
            .arg("-x") // no sound
            .arg("-t")
            .arg("jpg")
            .arg(filepath)
            .output()
            .map_err(|e| format!("Failed to run screencapture: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("could not create image") {
                return Err("Screen recording permission required. Go to System Settings > Privacy & Security > Screen Recording and enable SnapSolve.".to_string());
            }
            return Err(format!("screencapture failed: {}", stderr));
        }
        Ok(())
    }

    #[cfg(target_os = "windows")]
    {
        capture_via_powershell("powershell.exe", &filepath.to_string_lossy())
    }

    #[cfg(target_os = "linux")]
    {
        // Check if running in WSL
        let is_wsl = std::fs::read_to_string("/proc/version")
            .map(|v| v.to_lowercase().contains("microsoft") || v.to_lowercase().contains("wsl"))
            .unwrap_or(false);

        if is_wsl {
            return capture_wsl(filepath);
        }

        // Native Linux: use gnome-screenshot or scrot
        let output = std::process::Command::new("gnome-screenshot")
            .arg("-f")
            .arg(filepath)
            .output();

        if output.is_err() || !output.as_ref().map(|o| o.status.success()).unwrap_or(false) {
            std::process::Command::new("scrot")
                .arg(filepath)
                .output()
                .map_err(|e| {
                    format!(
                        "Failed to capture screenshot (install gnome-screenshot or scrot): {}",
                        e
                    )
                })?;
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        let _ = filepath;
        Err("Screenshot not supported on this platform".to_string())
    }
}

/// Captures the primary screen through PowerShell's System.Drawing APIs
#[cfg(any(target_os = "windows", target_os = "linux"))]
fn capture_via_powershell(shell: &str, save_path: &str) -> Result<(), String> {
    let ps_script = format!(
        "Add-Type -AssemblyName System.Windows.Forms; \
         $screen = [System.Windows.Forms.Screen]::PrimaryScreen; \
         $bitmap = New-Object System.Drawing.Bitmap($screen.Bounds.Width, $screen.Bounds.Height); \
         $graphics = [System.Drawing.Graphics]::FromImage($bitmap); \
         $graphics.CopyFromScreen($screen.Bounds.Location, [System.Drawing.Point]::Empty, $screen.Bounds.Size); \
         $bitmap.Save(\"{}\");",
        save_path
    );
    let output = std::process::Command::new(shell)
        .args(["-Command", &ps_script])
        .output()
        .map_err(|e| format!("Failed to capture screenshot via PowerShell: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "PowerShell screenshot failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}

/// In WSL the capture runs on the Windows side and lands in the Windows temp
/// directory, then gets copied into the queue
#[cfg(target_os = "linux")]
fn capture_wsl(filepath: &Path) -> Result<(), String> {
    let temp_filename = format!("snapsolve_screenshot_{}.png", std::process::id());
    capture_via_powershell("powershell.exe", &format!("$env:TEMP\\\\{}", temp_filename))?;

    let win_user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
    let temp_path = format!(
        "/mnt/c/Users/{}/AppData/Local/Temp/{}",
        win_user, temp_filename
    );

    std::fs::copy(&temp_path, filepath).map_err(|e| {
        format!(
            "Failed to copy screenshot from temp: {} (temp: {})",
            e, temp_path
        )
    })?;
    let _ = std::fs::remove_file(&temp_path);
    Ok(())
}

/// Loads a screenshot and returns it base64-encoded, re-encoded as JPEG and
/// downscaled so the payload stays reasonable for multimodal prompts
pub async fn load_payload_base64(path: &Path) -> Result<String, String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("Failed to read screenshot: {}", e))?;

    match image::load_from_memory(&bytes) {
        Ok(img) => {
            let img = if img.width() > MAX_PAYLOAD_WIDTH {
                img.resize(MAX_PAYLOAD_WIDTH, u32::MAX, FilterType::Triangle)
            } else {
                img
            };
            let rgb_img = img.to_rgb8();

            let mut buffer = std::io::Cursor::new(Vec::new());
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, 85);
            rgb_img
                .write_with_encoder(encoder)
                .map_err(|e| format!("Failed to encode screenshot: {}", e))?;
            Ok(BASE64.encode(buffer.into_inner()))
        }
        Err(e) => {
            // Not decodable; send the raw bytes and let the server cope
            warn!("could not decode {:?} ({}), sending raw bytes", path, e);
            Ok(BASE64.encode(&bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"fake image").unwrap();
        path
    }

    #[test]
    fn list_returns_oldest_first() {
        let dir = tempdir().unwrap();
        let queue = ScreenshotQueue::at(dir.path().to_path_buf());
        touch(dir.path(), "a.jpg");
        touch(dir.path(), "b.jpg");
        touch(dir.path(), "c.jpg");

        let listed = queue.list().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed[0].ends_with("a.jpg"));
        assert!(listed[2].ends_with("c.jpg"));
    }

    #[test]
    fn evict_overflow_drops_oldest_down_to_capacity() {
        let dir = tempdir().unwrap();
        let queue = ScreenshotQueue::at(dir.path().to_path_buf());
        let oldest = touch(dir.path(), "a.jpg");
        touch(dir.path(), "b.jpg");
        touch(dir.path(), "c.jpg");

        let evicted = queue.evict_overflow().unwrap();
        assert_eq!(evicted, vec![oldest.clone()]);
        assert!(!oldest.exists());

        let remaining = queue.list().unwrap();
        assert_eq!(remaining.len(), MAX_QUEUE_SIZE);
        assert!(remaining[0].ends_with("b.jpg"));
    }

    #[test]
    fn evict_overflow_is_a_noop_at_or_below_capacity() {
        let dir = tempdir().unwrap();
        let queue = ScreenshotQueue::at(dir.path().to_path_buf());
        touch(dir.path(), "a.jpg");
        touch(dir.path(), "b.jpg");

        assert!(queue.evict_overflow().unwrap().is_empty());
        assert_eq!(queue.list().unwrap().len(), 2);
    }

    #[test]
    fn delete_rejects_paths_outside_the_queue() {
        let dir = tempdir().unwrap();
        let queue = ScreenshotQueue::at(dir.path().join("queue"));
        std::fs::create_dir_all(dir.path().join("queue")).unwrap();
        let outside = touch(dir.path(), "outside.jpg");

        assert!(queue.delete(&outside).is_err());
        assert!(outside.exists());
    }

    #[test]
    fn clear_empties_the_queue() {
        let dir = tempdir().unwrap();
        let queue = ScreenshotQueue::at(dir.path().to_path_buf());
        touch(dir.path(), "a.jpg");
        touch(dir.path(), "b.jpg");

        queue.clear().unwrap();
        assert!(queue.list().unwrap().is_empty());
    }

    #[test]
    fn listing_a_missing_queue_directory_is_empty() {
        let dir = tempdir().unwrap();
        let queue = ScreenshotQueue::at(dir.path().join("never_created"));
        assert!(queue.list().unwrap().is_empty());
    }
}
