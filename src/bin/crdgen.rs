use anyhow::Result;

fn main() -> Result<()> {
    for crd in backup_operator::types::crds() {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
