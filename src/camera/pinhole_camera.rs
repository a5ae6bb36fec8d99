use anyhow::{bail, Context};
use nalgebra::{Matrix3, Rotation3};
use opencv::core::{FileNodeTraitConst, FileStorageTrait, FileStorageTraitConst};

use super::CameraTrait;
use crate::utility::Utility;

#[derive(Debug, Clone, PartialEq)]
pub struct PinholeParameters {
    pub camera_name: String,
    // size
    pub image_width: i32,
    pub image_height: i32,
    // intrinsic
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    // mount (rad)
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// 前置相机 640x360
impl Default for PinholeParameters {
    fn default() -> Self {
        Self {
            camera_name: "front".to_string(),
            image_width: 640,
            image_height: 360,
            fx: 529.1,
            fy: 529.1,
            cx: 350.6,
            cy: 182.2,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
        }
    }
}

impl PinholeParameters {
    pub const CAMERA_TYPE: &'static str = "PINHOLE";

    pub fn read_from_yaml(path: &str) -> anyhow::Result<Self> {
        let fs = opencv::core::FileStorage::new(
            path,
            opencv::core::FileStorage_Mode::READ as i32,
            "utf-8",
        )
        .with_context(|| format!("failed to open camera file {}", path))?;

        if !fs.is_opened()? {
            bail!("camera file {} could not be opened", path);
        }
        let model_type = fs.get("model_type")?.to_string()?;
        if model_type != Self::CAMERA_TYPE {
            bail!("model type is {}, expected {}", model_type, Self::CAMERA_TYPE);
        }
        // image
        let camera_name = fs.get("camera_name")?.to_string()?;
        let image_width = fs.get("image_width")?.to_i32()?;
        let image_height = fs.get("image_height")?.to_i32()?;
        // intrinsic
        let projection_parameters = fs.get("projection_parameters")?;
        let fx = projection_parameters.get("fx")?.to_f64()?;
        let fy = projection_parameters.get("fy")?.to_f64()?;
        let cx = projection_parameters.get("cx")?.to_f64()?;
        let cy = projection_parameters.get("cy")?.to_f64()?;
        // mount, 可选
        let mount_parameters = fs.get("mount_parameters")?;
        let (roll, pitch, yaw) = if mount_parameters.empty()? {
            (0.0, 0.0, 0.0)
        } else {
            (
                mount_parameters.get("roll")?.to_f64()?,
                mount_parameters.get("pitch")?.to_f64()?,
                mount_parameters.get("yaw")?.to_f64()?,
            )
        };
        if fx <= 0.0 || fy <= 0.0 || image_width <= 0 || image_height <= 0 {
            bail!("invalid pinhole parameters in {}", path);
        }

        Ok(Self {
            camera_name,
            image_width,
            image_height,
            fx,
            fy,
            cx,
            cy,
            roll,
            pitch,
            yaw,
        })
    }

    pub fn write_to_yaml(&self, path: &str) -> anyhow::Result<()> {
        let mut fs = opencv::core::FileStorage::new(
            path,
            opencv::core::FileStorage_Mode::WRITE as i32,
            "utf-8",
        )?;

        fs.write_str("model_type", Self::CAMERA_TYPE)?;
        fs.write_str("camera_name", &self.camera_name)?;
        fs.write_i32("image_width", self.image_width)?;
        fs.write_i32("image_height", self.image_height)?;
        // intrinsic
        fs.start_write_struct("projection_parameters", opencv::core::FileNode_MAP, "")?;
        fs.write_f64("fx", self.fx)?;
        fs.write_f64("fy", self.fy)?;
        fs.write_f64("cx", self.cx)?;
        fs.write_f64("cy", self.cy)?;
        fs.end_write_struct()?;
        // mount
        fs.start_write_struct("mount_parameters", opencv::core::FileNode_MAP, "")?;
        fs.write_f64("roll", self.roll)?;
        fs.write_f64("pitch", self.pitch)?;
        fs.write_f64("yaw", self.yaw)?;
        fs.end_write_struct()?;
        fs.release()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PinholeCamera {
    pub parameters: PinholeParameters,
    k: Matrix3<f64>,
    cam_to_drone: Rotation3<f64>,
}

impl PinholeCamera {
    pub fn new(camera_file: &str) -> anyhow::Result<Self> {
        let parameters = PinholeParameters::read_from_yaml(camera_file)?;
        log::info!("camera {} loaded from {}", parameters.camera_name, camera_file);
        Ok(Self::from_parameters(parameters))
    }

    pub fn from_parameters(parameters: PinholeParameters) -> Self {
        let p = &parameters;
        let k = Matrix3::new(p.fx, 0.0, p.cx, 0.0, p.fy, p.cy, 0.0, 0.0, 1.0);
        let cam_to_drone = Utility::mount_rotation(p.roll, p.pitch, p.yaw);
        Self {
            parameters,
            k,
            cam_to_drone,
        }
    }
}

impl CameraTrait for PinholeCamera {
    fn intrinsic_matrix(&self) -> Matrix3<f64> {
        self.k
    }

    fn image_size(&self) -> (u32, u32) {
        (
            self.parameters.image_width as u32,
            self.parameters.image_height as u32,
        )
    }

    fn cam_to_drone(&self) -> Rotation3<f64> {
        self.cam_to_drone
    }

    fn mount_angles(&self) -> [f64; 3] {
        [
            self.parameters.roll,
            self.parameters.pitch,
            self.parameters.yaw,
        ]
    }
}

#[test]
fn read_from_yaml() {
    let dir = std::env::temp_dir().join(format!("vslam_map_camera_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("front.yaml");
    let path = path.to_str().unwrap();

    let mut parameters = PinholeParameters::default();
    parameters.pitch = -0.2;
    parameters.write_to_yaml(path).unwrap();
    let read = PinholeParameters::read_from_yaml(path).unwrap();
    assert_eq!(read, parameters);

    assert!(PinholeParameters::read_from_yaml(dir.join("missing.yaml").to_str().unwrap()).is_err());
    std::fs::remove_dir_all(&dir).ok();
}
