fn main() -> anyhow::Result<()> {
    mock_engine::run()
}
