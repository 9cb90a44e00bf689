use adforge_engine::StatsSnapshot;

/// Final report block printed after every run, shutdown included.
pub fn format_report(stats: &StatsSnapshot) -> String {
    let elapsed = stats.elapsed_secs;
    let throughput = stats.total as f64 / elapsed.max(0.1);
    format!(
        "\n{line}\n  PIPELINE REPORT\n{line}\n\
         \x20 Processed        : {}\n\
         \x20 Success          : {}\n\
         \x20 Failed           : {}\n\
         \x20 Placeholders     : {}\n\
         \x20 BG removed       : {}\n\
         \x20 BG skipped       : {}\n\
         \x20 Cache hits       : {}\n\
         \x20 DLQ retries      : {}\n\
         \x20 Verified         : {}\n\
         \x20 Verify rejects   : {}\n\
         \x20 Post-verified    : {}\n\
         \x20 Post-verify rej. : {}\n\
         \x20 Recomposes       : {}\n\
         \x20 Already done     : {}\n\
         \x20 Elapsed          : {elapsed:.1}s\n\
         \x20 Throughput       : {throughput:.2} ads/s\n{line}",
        stats.total,
        stats.success,
        stats.failed,
        stats.placeholder,
        stats.bg_removed,
        stats.bg_skipped,
        stats.cache_hits,
        stats.dlq_retries,
        stats.verified,
        stats.verify_fails,
        stats.post_verified,
        stats.post_verify_fails,
        stats.recomposes,
        stats.skipped,
        line = "=".repeat(60),
    )
}
