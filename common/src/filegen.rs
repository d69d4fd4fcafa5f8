use anyhow::Context;
use tracing::instrument;

/// Writes `filesize` bytes of random data to `path`, replacing any existing content.
#[instrument]
pub async fn write_random_file(
    path: &std::path::Path,
    mut filesize: u64,
    bufsize: usize,
) -> anyhow::Result<u64> {
    use rand::Rng;
    use tokio::io::AsyncWriteExt;
    let original_filesize = filesize;
    let mut bytes = vec![0u8; bufsize.max(1)];
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .with_context(|| format!("Error opening {:?}", &path))?;
    while filesize > 0 {
        {
            // make sure rng falls out of scope before await
            let mut rng = rand::thread_rng();
            rng.fill(&mut bytes[..]);
        }
        let writesize = std::cmp::min(filesize, bytes.len() as u64) as usize;
        file.write_all(&bytes[..writesize])
            .await
            .with_context(|| format!("Error writing to {:?}", &path))?;
        filesize -= writesize as u64;
    }
    file.sync_all()
        .await
        .with_context(|| format!("Error syncing {:?}", &path))?;
    Ok(original_filesize)
}
