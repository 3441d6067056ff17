use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use async_trait::async_trait;
use image::RgbImage;
use uuid::Uuid;

use crate::error::{DeviceFailure, StreamError};
use crate::media::{FacingMode, MediaDevices, MediaStream, VideoConstraints};

const PREVIEW_SIZE: (u32, u32) = (640, 480);
const PREVIEW_QUALITY: u8 = 85;
const FRAME_INTERVAL_MS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraTool {
    /// libcamera based `rpicam-still`.
    Rpicam,
    /// Legacy `raspistill`.
    Raspistill,
}

impl CameraTool {
    pub fn program(&self) -> &'static str {
        match self {
            CameraTool::Rpicam => "rpicam-still",
            CameraTool::Raspistill => "raspistill",
        }
    }

    /// Arguments for a process that keeps rewriting `output` with fresh frames.
    pub fn preview_args(&self, output: &Path, camera: usize, width: u32, height: u32) -> Vec<String> {
        let output = output.display().to_string();
        match self {
            CameraTool::Rpicam => vec![
                "-o".into(),
                output,
                "--camera".into(),
                camera.to_string(),
                "--width".into(),
                width.to_string(),
                "--height".into(),
                height.to_string(),
                "--quality".into(),
                PREVIEW_QUALITY.to_string(),
                "--timeout".into(),
                "0".into(),
                "--timelapse".into(),
                FRAME_INTERVAL_MS.to_string(),
                "--nopreview".into(),
            ],
            CameraTool::Raspistill => vec![
                "-o".into(),
                output,
                "-cs".into(),
                camera.to_string(),
                "-w".into(),
                width.to_string(),
                "-h".into(),
                height.to_string(),
                "-q".into(),
                PREVIEW_QUALITY.to_string(),
                "-t".into(),
                "0".into(),
                "-tl".into(),
                FRAME_INTERVAL_MS.to_string(),
                "-n".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub index: usize,
    pub model: String,
}

/// Parse the `--list-cameras` output, e.g.
/// `0 : ov5647 [2592x1944 10-bit GBRG] (/base/soc/i2c0mux/i2c@1/ov5647@36)`.
pub fn parse_camera_list(output: &str) -> Vec<CameraInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (index, rest) = line.trim().split_once(" : ")?;
            let index = index.trim().parse().ok()?;
            let model = rest.split_whitespace().next()?.to_string();
            Some(CameraInfo { index, model })
        })
        .collect()
}

/// Camera index for a facing mode: the first camera faces the user, the
/// second (if fitted) the environment.
pub fn camera_for(facing: Option<FacingMode>, cameras: usize) -> Option<usize> {
    match facing {
        None | Some(FacingMode::User) if cameras > 0 => Some(0),
        Some(FacingMode::Environment) if cameras > 1 => Some(1),
        _ => None,
    }
}

/// Translate a process spawn failure into a media failure name.
pub fn spawn_failure(error: &io::Error) -> DeviceFailure {
    let name = match error.kind() {
        io::ErrorKind::NotFound => "NotSupportedError",
        io::ErrorKind::PermissionDenied => "NotAllowedError",
        _ => "AbortError",
    };
    DeviceFailure::new(name, error.to_string())
}

/// Raspberry Pi camera driven through the command line tools.
pub struct RpicamDevices {
    tool: Option<CameraTool>,
    cameras: Vec<CameraInfo>,
    frame_dir: PathBuf,
}

impl RpicamDevices {
    /// Look for `rpicam-still`, then `raspistill`, and enumerate cameras.
    pub fn detect(frame_dir: impl Into<PathBuf>) -> Self {
        log::info!("Initializing camera backend...");
        let tool = match Command::new("rpicam-still").arg("--help").output() {
            Ok(_) => {
                log::info!("Raspberry Pi Camera available (using rpicam-still)");
                Some(CameraTool::Rpicam)
            }
            Err(e) => {
                log::warn!("rpicam-still not found: {}", e);
                match Command::new("raspistill").arg("-?").output() {
                    Ok(_) => {
                        log::info!("Raspberry Pi Camera available (using legacy raspistill)");
                        Some(CameraTool::Raspistill)
                    }
                    Err(e) => {
                        log::error!("Neither rpicam-still nor raspistill found: {}", e);
                        None
                    }
                }
            }
        };

        let cameras = match tool {
            Some(CameraTool::Rpicam) => Command::new("rpicam-still")
                .arg("--list-cameras")
                .output()
                .map(|output| {
                    // The listing goes to stderr on some releases
                    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                    parse_camera_list(&text)
                })
                .unwrap_or_default(),
            // raspistill cannot enumerate; assume the single ribbon camera
            Some(CameraTool::Raspistill) => vec![CameraInfo {
                index: 0,
                model: "legacy".to_string(),
            }],
            None => Vec::new(),
        };
        log::info!("Found {} camera(s)", cameras.len());

        Self {
            tool,
            cameras,
            frame_dir: frame_dir.into(),
        }
    }

    pub fn tool(&self) -> Option<CameraTool> {
        self.tool
    }

    pub fn cameras(&self) -> &[CameraInfo] {
        &self.cameras
    }
}

#[async_trait]
impl MediaDevices for RpicamDevices {
    fn is_supported(&self) -> bool {
        self.tool.is_some()
    }

    async fn get_user_media(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Box<dyn MediaStream>, DeviceFailure> {
        let tool = self
            .tool
            .ok_or_else(|| DeviceFailure::new("NotSupportedError", "no camera tool installed"))?;
        let camera = camera_for(constraints.facing_mode, self.cameras.len()).ok_or_else(|| {
            DeviceFailure::new(
                "NotFoundError",
                format!("no camera for facing mode {:?}", constraints.facing_mode),
            )
        })?;
        let (width, height) = constraints.ideal_size().unwrap_or(PREVIEW_SIZE);

        let frame_path = self
            .frame_dir
            .join(format!("tryon-preview-{}.jpg", Uuid::new_v4()));
        let args = tool.preview_args(&frame_path, camera, width, height);
        log::info!("Preview command: {} {}", tool.program(), args.join(" "));

        let mut child = Command::new(tool.program())
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_failure(&e))?;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(DeviceFailure::new(
                "NotReadableError",
                format!("{} exited immediately: {}", tool.program(), status),
            ));
        }

        let model = self
            .cameras
            .get(camera)
            .map(|c| c.model.clone())
            .unwrap_or_else(|| format!("camera {}", camera));

        Ok(Box::new(RpicamStream {
            child: Some(child),
            frame_path,
            size: (width, height),
            label: model,
        }))
    }
}

pub struct RpicamStream {
    child: Option<Child>,
    frame_path: PathBuf,
    size: (u32, u32),
    label: String,
}

impl RpicamStream {
    fn read_frame(&self) -> Result<RgbImage, StreamError> {
        if !self.frame_path.exists() {
            return Err(StreamError::NoFrame("preview file not written yet".to_string()));
        }
        // The tool may be midway through rewriting the file
        let image = image::open(&self.frame_path).map_err(|e| StreamError::NoFrame(e.to_string()))?;
        Ok(image.to_rgb8())
    }
}

#[async_trait]
impl MediaStream for RpicamStream {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn play(&mut self) -> Result<(), StreamError> {
        let child = self.child.as_mut().ok_or(StreamError::Stopped)?;
        if let Some(status) = child.try_wait()? {
            return Err(StreamError::PlaybackBlocked(format!(
                "camera process exited: {}",
                status
            )));
        }
        self.read_frame()
            .map(|_| ())
            .map_err(|e| StreamError::PlaybackBlocked(e.to_string()))
    }

    fn video_size(&self) -> Option<(u32, u32)> {
        Some(self.size)
    }

    fn current_frame(&mut self) -> Result<RgbImage, StreamError> {
        if self.child.is_none() {
            return Err(StreamError::Stopped);
        }
        let frame = self.read_frame()?;
        log::debug!("Read preview frame: {}x{}", frame.width(), frame.height());
        Ok(frame)
    }

    fn live_tracks(&self) -> usize {
        usize::from(self.child.is_some())
    }

    fn stop_all(&mut self) {
        if let Some(mut process) = self.child.take() {
            let _ = process.kill();
            let _ = process.wait();
            log::info!("Camera preview stopped");
        }
        if self.frame_path.exists() {
            let _ = std::fs::remove_file(&self.frame_path);
        }
    }
}

impl Drop for RpicamStream {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceErrorKind;

    #[test]
    fn test_parse_camera_list() {
        let output = "Available cameras\n\
            -----------------\n\
            0 : ov5647 [2592x1944 10-bit GBRG] (/base/soc/i2c0mux/i2c@1/ov5647@36)\n    \
            Modes: 'SGBRG10_CSI2P' : 640x480 [58.92 fps - (16, 0)/2560x1920 crop]\n\
            1 : imx219 [3280x2464 10-bit RGGB] (/base/soc/i2c0mux/i2c@0/imx219@10)\n";

        let cameras = parse_camera_list(output);
        assert_eq!(cameras.len(), 2);
        assert_eq!(cameras[0], CameraInfo { index: 0, model: "ov5647".to_string() });
        assert_eq!(cameras[1].model, "imx219");
        assert!(parse_camera_list("No cameras available!").is_empty());
    }

    #[test]
    fn test_camera_for_facing() {
        assert_eq!(camera_for(Some(FacingMode::User), 1), Some(0));
        assert_eq!(camera_for(None, 1), Some(0));
        assert_eq!(camera_for(Some(FacingMode::Environment), 1), None);
        assert_eq!(camera_for(Some(FacingMode::Environment), 2), Some(1));
        assert_eq!(camera_for(None, 0), None);
    }

    #[test]
    fn test_spawn_failures_classify() {
        let missing = spawn_failure(&io::Error::new(io::ErrorKind::NotFound, "no such file"));
        assert_eq!(DeviceErrorKind::classify(&missing.name), DeviceErrorKind::Unsupported);

        let denied = spawn_failure(&io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert_eq!(DeviceErrorKind::classify(&denied.name), DeviceErrorKind::PermissionDenied);

        let other = spawn_failure(&io::Error::new(io::ErrorKind::Other, "busy"));
        assert_eq!(DeviceErrorKind::classify(&other.name), DeviceErrorKind::Unknown);
    }

    #[test]
    fn test_preview_args() {
        let path = Path::new("/tmp/frame.jpg");
        let args = CameraTool::Rpicam.preview_args(path, 1, 1280, 720);
        assert_eq!(&args[..4], &["-o", "/tmp/frame.jpg", "--camera", "1"]);
        assert!(args.windows(2).any(|w| w == ["--timelapse", "200"]));

        let legacy = CameraTool::Raspistill.preview_args(path, 0, 640, 480);
        assert!(legacy.windows(2).any(|w| w == ["-w", "640"]));
        assert_eq!(legacy.last().map(String::as_str), Some("-n"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_unsupported() {
        let devices = RpicamDevices {
            tool: None,
            cameras: Vec::new(),
            frame_dir: std::env::temp_dir(),
        };
        assert!(!devices.is_supported());
        let failure = devices
            .get_user_media(&VideoConstraints::any())
            .await
            .err()
            .unwrap();
        assert_eq!(failure.name, "NotSupportedError");
    }
}
