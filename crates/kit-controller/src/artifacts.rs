//! 引导制品批量同步
//!
//! `DirectoryIterator` 在构造时遍历一次目录树，得到有序的文件列表，
//! 之后惰性地逐个打开文件并交给上传流水线。任何一次打开失败都会被记录，
//! 后续文件不再打开；每个已打开的文件在上传结束后都会被关闭，无论上传是否成功。

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use kit_common::{Error, Result};

use crate::cloud::{BucketStore, MAX_BATCH_DELETE};

/// 文件打开与关闭
pub trait Opener: Send {
    type Handle: Read + Send + 'static;

    fn open(&mut self, path: &Path) -> io::Result<Self::Handle>;

    fn close(&mut self, path: &Path, handle: Self::Handle) -> io::Result<()>;
}

/// 直接读取本地文件
#[derive(Debug, Default, Clone, Copy)]
pub struct FsOpener;

impl Opener for FsOpener {
    type Handle = File;

    fn open(&mut self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn close(&mut self, _path: &Path, handle: File) -> io::Result<()> {
        drop(handle);
        Ok(())
    }
}

/// 目录迭代器
pub struct DirectoryIterator<O: Opener = FsOpener> {
    root: PathBuf,
    remaining: VecDeque<PathBuf>,
    current: Option<(PathBuf, O::Handle)>,
    opener: O,
    err: Option<io::Error>,
}

impl DirectoryIterator<FsOpener> {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_opener(root, FsOpener)
    }
}

impl<O: Opener> DirectoryIterator<O> {
    /// 遍历目录树并按路径排序，目录本身不计入
    pub fn with_opener(root: impl Into<PathBuf>, opener: O) -> Result<Self> {
        let root = root.into();
        let mut remaining = VecDeque::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("遍历 {} 失败: {e}", root.display()),
                ))
            })?;
            if entry.file_type().is_file() {
                remaining.push_back(entry.into_path());
            }
        }
        debug!("{} 下共有 {} 个待上传文件", root.display(), remaining.len());
        Ok(Self {
            root,
            remaining,
            current: None,
            opener,
            err: None,
        })
    }

    /// 打开下一个文件；列表耗尽或已记录错误时返回 false
    pub fn has_next(&mut self) -> bool {
        if let Some((path, handle)) = self.current.take() {
            if let Err(e) = self.opener.close(&path, handle) {
                self.err = Some(e);
            }
        }
        if self.err.is_some() {
            return false;
        }
        let Some(path) = self.remaining.pop_front() else {
            return false;
        };
        match self.opener.open(&path) {
            Ok(handle) => {
                self.current = Some((path, handle));
                true
            }
            Err(e) => {
                warn!("打开 {} 失败: {}", path.display(), e);
                self.err = Some(e);
                false
            }
        }
    }

    /// 取出当前打开的文件作为上传单元
    pub fn current_upload_unit(&mut self) -> Option<UploadUnit<'_, O>> {
        let (path, handle) = self.current.take()?;
        let key = match relative_key(&self.root, &path) {
            Ok(key) => key,
            Err(e) => {
                let mut message = e.to_string();
                if let Err(close_err) = self.opener.close(&path, handle) {
                    warn!("关闭 {} 失败: {}", path.display(), close_err);
                    message = format!("{message}; 关闭失败: {close_err}");
                }
                self.err = Some(io::Error::new(io::ErrorKind::InvalidInput, message));
                return None;
            }
        };
        Some(UploadUnit {
            key,
            path,
            handle: Some(handle),
            opener: &mut self.opener,
            close_err: &mut self.err,
        })
    }

    pub fn err(&self) -> Option<&io::Error> {
        self.err.as_ref()
    }
}

/// 一次上传：目标键、可读内容，以及离开作用域时执行的关闭操作
pub struct UploadUnit<'a, O: Opener> {
    key: String,
    path: PathBuf,
    handle: Option<O::Handle>,
    opener: &'a mut O,
    close_err: &'a mut Option<io::Error>,
}

impl<'a, O: Opener> UploadUnit<'a, O> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 在阻塞线程池中读出全部内容，句柄留待关闭
    pub async fn read_body(&mut self) -> io::Result<Vec<u8>> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(Vec::new());
        };
        let (handle, body) = tokio::task::spawn_blocking(move || {
            let mut body = Vec::new();
            let read = handle.read_to_end(&mut body).map(|_| body);
            (handle, read)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("读取任务异常退出: {e}")))?;
        self.handle = Some(handle);
        body
    }

    /// 显式关闭并返回关闭错误
    pub fn close(mut self) -> io::Result<()> {
        match self.handle.take() {
            Some(handle) => self.opener.close(&self.path, handle),
            None => Ok(()),
        }
    }
}

impl<'a, O: Opener> Drop for UploadUnit<'a, O> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.opener.close(&self.path, handle) {
                self.close_err.get_or_insert(e);
            }
        }
    }
}

/// 相对于根目录、以 `/` 分隔的对象键
pub(crate) fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::Store(format!("{} 不在 {} 之下", path.display(), root.display())))?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// 逐个上传迭代器中的文件，返回上传数量
///
/// 每个单元上传后都会关闭；遇到第一个上传、关闭或打开错误即停止。
pub async fn upload_with_iterator<O: Opener>(
    store: &dyn BucketStore,
    bucket: &str,
    iterator: &mut DirectoryIterator<O>,
) -> Result<usize> {
    let mut uploaded = 0;
    while iterator.has_next() {
        let Some(mut unit) = iterator.current_upload_unit() else {
            break;
        };
        let key = unit.key().to_string();
        let upload = match unit.read_body().await {
            Ok(body) => store.put_object(bucket, &key, body).await,
            Err(e) => Err(e.into()),
        };
        let close = unit.close();
        upload?;
        close?;
        uploaded += 1;
    }
    if let Some(e) = iterator.err() {
        return Err(io::Error::new(e.kind(), e.to_string()).into());
    }
    info!("已向桶 {} 上传 {} 个文件", bucket, uploaded);
    Ok(uploaded)
}

/// 分批删除桶内所有对象；桶不存在时视为已清空
pub async fn empty_bucket(store: &dyn BucketStore, bucket: &str) -> Result<()> {
    let keys = match store.list_objects(bucket).await {
        Ok(keys) => keys,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    for batch in keys.chunks(MAX_BATCH_DELETE) {
        store.delete_objects(bucket, batch).await?;
    }
    debug!("已清空桶 {}，共 {} 个对象", bucket, keys.len());
    Ok(())
}
