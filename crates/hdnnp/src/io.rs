//! ファイル入出力
//!
//! 拡張子 `.gz` は透過的に圧縮・展開する。チェックポイントなど途中で
//! 壊れてはならないファイルは一時ファイルに書いてから rename する。

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

fn is_gz(p: &Path) -> bool {
    p.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

pub fn open_reader<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn BufRead>> {
    let p = path.as_ref();
    let f = File::open(p)?;
    if is_gz(p) {
        let dec = flate2::read::GzDecoder::new(f);
        return Ok(Box::new(BufReader::with_capacity(128 * 1024, dec)));
    }
    Ok(Box::new(BufReader::with_capacity(128 * 1024, f)))
}

/// Writer wrapper to propagate finish/close errors for compressed outputs.
#[must_use = "call .close() to propagate compression/IO errors"]
pub enum Writer {
    Plain(BufWriter<File>),
    Gz(flate2::write::GzEncoder<BufWriter<File>>),
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Writer::Plain(f) => f.write(buf),
            Writer::Gz(e) => e.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Writer::Plain(f) => f.flush(),
            Writer::Gz(e) => e.flush(),
        }
    }
}

impl Writer {
    fn new(file: File, gz: bool) -> Self {
        let buffered = BufWriter::new(file);
        if gz {
            Writer::Gz(flate2::write::GzEncoder::new(buffered, flate2::Compression::default()))
        } else {
            Writer::Plain(buffered)
        }
    }

    /// Finalize the stream and return the underlying file.
    pub fn close(self) -> io::Result<File> {
        let buffered = match self {
            Writer::Plain(f) => f,
            Writer::Gz(e) => e.finish()?,
        };
        // into_inner() flushes internal buffer; propagate error if flush fails
        buffered.into_inner().map_err(|e| e.into_error())
    }
}

/// 同じディレクトリの一時ファイルに書き込み、完了後に `path` へ rename する
///
/// 書き込みやクローズが失敗した場合、`path` の既存内容は変更されない。
pub fn write_atomic<P, F>(path: P, write: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut Writer) -> io::Result<()>,
{
    let p = path.as_ref();
    let dir = match p.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let tmp = NamedTempFile::new_in(dir)?;
    let mut writer = Writer::new(tmp.as_file().try_clone()?, is_gz(p));
    write(&mut writer)?;
    writer.close()?.sync_all()?;
    tmp.persist(p).map_err(|e| e.error)?;
    Ok(())
}

/// JSON (拡張子が `.gz` なら圧縮) をアトミックに書き出す
pub fn write_json<P: AsRef<Path>, T: Serialize + ?Sized>(path: P, value: &T) -> io::Result<()> {
    write_atomic(path, |w| {
        serde_json::to_writer(&mut *w, value).map_err(io::Error::other)?;
        w.write_all(b"\n")
    })
}

pub fn read_json<P: AsRef<Path>, T: DeserializeOwned>(path: P) -> io::Result<T> {
    let reader = open_reader(path)?;
    serde_json::from_reader(reader).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
