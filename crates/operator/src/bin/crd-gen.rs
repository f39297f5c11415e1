use keel_operator::KeelApp;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&KeelApp::crd())?;
    print!("{yaml}");
    Ok(())
}
