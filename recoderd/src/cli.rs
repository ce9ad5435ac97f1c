use std::path::PathBuf;

xflags::xflags! {
    /// Matroska re-encoding proxy.
    cmd recoderd {
        /// Path to ffmpeg (default ./ffmpeg)
        optional --ffmpeg path: PathBuf

        /// Path to ffprobe (default ./ffprobe)
        optional --ffprobe path: PathBuf

        /// Root of the per-stream output directories (default ./unpack)
        optional --folder path: PathBuf

        /// Port to listen on (default 8888)
        optional -p, --port port: u16

        repeated -v, --verbose
    }
}
