//! `hansard probe` - show audio metadata.

use std::path::PathBuf;

use anyhow::Result;

pub async fn run(audio: PathBuf) -> Result<()> {
    let metadata = hansard_core::probe(&audio).await?;
    println!("path:        {}", metadata.path.display());
    println!("size:        {} bytes", metadata.size_bytes);
    println!(
        "duration:    {:.1} s ({:.1} min)",
        metadata.duration_seconds,
        metadata.duration_seconds / 60.0
    );
    println!("codec:       {}", metadata.codec);
    println!("sample rate: {} Hz", metadata.sample_rate_hz);
    println!("channels:    {}", metadata.channels);
    if let Some(bitrate) = metadata.bitrate_bps {
        println!("bitrate:     {} bps", bitrate);
    }
    Ok(())
}
