use crate::video::VideoBackend;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1", env = "TREE_DETECT_HOST")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 8501, env = "TREE_DETECT_PORT")]
    pub port: u16,

    /// Detection model loaded once at startup
    #[arg(long, default_value = "best.onnx", env = "TREE_DETECT_MODEL")]
    pub model: PathBuf,

    /// Directory uploaded files are written to
    #[arg(long, default_value = "uploads", env = "TREE_DETECT_UPLOAD_DIR")]
    pub upload_dir: PathBuf,

    /// Root directory for output artifacts
    #[arg(long, default_value = "outputs", env = "TREE_DETECT_OUTPUT_ROOT")]
    pub output_root: PathBuf,

    /// Project directory name under the output root
    #[arg(long, default_value = "results", env = "TREE_DETECT_PROJECT")]
    pub project: String,

    /// Run directory name under the project directory
    #[arg(long, default_value = "run", env = "TREE_DETECT_RUN_NAME")]
    pub run_name: String,

    /// Default confidence threshold
    #[arg(long, default_value_t = 0.25, env = "TREE_DETECT_CONF")]
    pub conf: f32,

    /// Default video frame stride (1 = every frame)
    #[arg(long, default_value_t = 1, env = "TREE_DETECT_VID_STRIDE")]
    pub vid_stride: usize,

    /// Video decoding backend
    #[arg(long, value_enum, default_value_t = VideoBackend::Opencv, env = "TREE_DETECT_VIDEO_BACKEND")]
    pub video_backend: VideoBackend,

    /// Force CPU-only model execution
    #[arg(long, env = "TREE_DETECT_FORCE_CPU")]
    pub force_cpu: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn project_dir(&self) -> PathBuf {
        self.output_root.join(&self.project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_expected_layout() {
        let args = Args::try_parse_from(["tree-detect"]).unwrap();
        assert_eq!(args.conf, 0.25);
        assert_eq!(args.vid_stride, 1);
        assert_eq!(args.project_dir(), PathBuf::from("outputs/results"));
        assert_eq!(args.run_name, "run");
        assert_eq!(args.video_backend, VideoBackend::Opencv);
        assert!(!args.force_cpu);
    }

    #[test]
    fn backend_and_cpu_flags_parse() {
        let args = Args::try_parse_from([
            "tree-detect",
            "--video-backend",
            "ffmpeg",
            "--force-cpu",
            "--conf",
            "0.6",
        ])
        .unwrap();
        assert_eq!(args.video_backend, VideoBackend::Ffmpeg);
        assert!(args.force_cpu);
        assert_eq!(args.conf, 0.6);
    }
}
