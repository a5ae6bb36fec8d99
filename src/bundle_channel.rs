//! BA 服务的传输
//!
//! 请求写入交换目录中的 `bundle_<seq>.json`，外部 BA 服务把结果写入 `bundled_<seq>.json`。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::map::{BundleRequest, BundleResponse};

#[derive(Debug, Clone)]
pub struct FileBundleChannel {
    dir: PathBuf,
}

impl FileBundleChannel {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create exchange directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn request_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("bundle_{}.json", seq))
    }

    pub fn response_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("bundled_{}.json", seq))
    }

    /// 先写临时文件再改名，避免对方读到写了一半的文件
    pub fn send(&self, request: &BundleRequest) -> Result<PathBuf> {
        let path = self.request_path(request.seq);
        let tmp = path.with_extension("json.tmp");
        let file = std::fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        serde_json::to_writer(std::io::BufWriter::new(file), request)
            .with_context(|| format!("failed to write bundle request {}", request.seq))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move {} to {}", tmp.display(), path.display()))?;
        log::info!("bundle request {} sent to {}", request.seq, path.display());
        Ok(path)
    }

    /// 读取序号为 `seq` 的响应，还没有结果时返回 `None`。读取之后删除响应文件。
    pub fn poll(&self, seq: u64) -> Result<Option<BundleResponse>> {
        let path = self.response_path(seq);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let response: BundleResponse = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse bundle response {}", path.display()))?;
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(Some(response))
    }
}
