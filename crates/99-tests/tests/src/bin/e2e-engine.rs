//! Echo engine the end-to-end suites spawn.

fn main() -> anyhow::Result<()> {
    mock_engine::run()
}
