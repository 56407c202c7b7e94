use kube::CustomResourceExt;
use site_operator::Site;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&Site::crd())?;
    print!("{yaml}");
    Ok(())
}
