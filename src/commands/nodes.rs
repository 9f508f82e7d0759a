use anyhow::Result;

use vsphere_node_checker::cluster::provider_id;
use vsphere_node_checker::context::Cancellation;
use vsphere_node_checker::identity;
use vsphere_node_checker::infra::Property;

use super::open_session;
use crate::cli::SourceArgs;

pub async fn run(source: SourceArgs) -> Result<()> {
    let session = open_session(&source, &[], false).await?;
    let ctx = &session.context(Cancellation::new()).await?;

    let nodes = match ctx.cluster().list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            ctx.close().await;
            return Err(e);
        }
    };

    let mut rows: Vec<(String, String, String, String)> = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let name = node.metadata.name.clone().unwrap_or_else(|| "<unnamed>".into());
        let pid = provider_id(node).unwrap_or("<none>").to_string();

        let (path, status) = match identity::resolve(ctx, node).await {
            Ok(reference) => {
                let verified = match ctx
                    .fetch_properties(&reference.object, &[Property::ConfigUuid])
                    .await
                {
                    Ok(bag) => identity::verify_identity(&reference, &bag),
                    Err(e) => Err(e),
                };
                let status = match verified {
                    Ok(()) => reference.object.to_string(),
                    Err(e) => e.kind().to_string(),
                };
                (reference.inventory_path, status)
            }
            Err(e) => (ctx.metadata().vm_path(&name), e.kind().to_string()),
        };
        rows.push((name, pid, path, status));
    }
    ctx.close().await;

    rows.sort_by(|a, b| a.0.cmp(&b.0));

    println!(
        "{:<24} {:<50} {:<40} {:<20}",
        "NODE", "PROVIDER ID", "INVENTORY PATH", "VM"
    );
    println!("{}", "-".repeat(137));

    for (name, pid, path, status) in &rows {
        println!("{:<24} {:<50} {:<40} {:<20}", name, pid, path, status);
    }

    println!("\nTotal: {} nodes", rows.len());

    Ok(())
}
