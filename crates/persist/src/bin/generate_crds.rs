use anyhow::Result;
use devconsole_persist::crd::{Cron, MPIJob, Notebook, PyTorchJob, TFJob, User, XDLJob, XGBoostJob};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let crds = [
        ("TFJob", TFJob::crd()),
        ("PyTorchJob", PyTorchJob::crd()),
        ("XDLJob", XDLJob::crd()),
        ("XGBoostJob", XGBoostJob::crd()),
        ("MPIJob", MPIJob::crd()),
        ("Cron", Cron::crd()),
        ("Notebook", Notebook::crd()),
        ("User", User::crd()),
    ];

    for (kind, crd) in crds {
        println!("---");
        println!("# {} CRD", kind);
        println!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
