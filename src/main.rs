fn main() -> anyhow::Result<()> {
    tubeshelf_lib::run()
}
