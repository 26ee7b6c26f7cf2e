//! Image build pipelines of EC2 Image Builder, driven through the AWS command line interface.
use anyhow::Context;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::build::{BuildInfo, BuildPipelineHandler, BuildResult, BuildStatus};
use crate::common::command::run_json_command;
use crate::common::timeutils::parse_timestamp;

pub struct ImageBuilderHandler {
    aws_cli: Vec<String>,
    region: Option<String>,
}

impl ImageBuilderHandler {
    pub fn new(aws_cli: Vec<String>, region: Option<String>) -> Self {
        Self { aws_cli, region }
    }

    fn command(&self, subcommand: &str, args: &[&str]) -> Vec<String> {
        let mut command = self.aws_cli.clone();
        command.push("imagebuilder".to_string());
        command.push(subcommand.to_string());
        command.extend(args.iter().map(|arg| arg.to_string()));
        command.extend(["--output".to_string(), "json".to_string()]);
        if let Some(region) = &self.region {
            command.extend(["--region".to_string(), region.clone()]);
        }
        command
    }

    async fn pipeline_by_name(&self, name: &str) -> BuildResult<Option<String>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Output {
            #[serde(default)]
            image_pipeline_list: Vec<Pipeline>,
        }
        #[derive(Deserialize)]
        struct Pipeline {
            arn: String,
            name: String,
        }

        let filter = format!("name=name,values={name}");
        let output: Output = run_json_command(&self.command(
            "list-image-pipelines",
            &["--filters", &filter],
        ))
        .await
        .context("Cannot list image pipelines")?;
        Ok(output
            .image_pipeline_list
            .into_iter()
            .find(|pipeline| pipeline.name == name)
            .map(|pipeline| pipeline.arn))
    }

    async fn pipeline_builds(&self, pipeline_arn: &str) -> BuildResult<Vec<BuildInfo>> {
        let output = run_json_command(&self.command(
            "list-image-pipeline-images",
            &["--image-pipeline-arn", pipeline_arn],
        ))
        .await
        .context("Cannot list pipeline images")?;
        parse_builds(output)
    }

    async fn image_of_build(&self, build_arn: &str) -> BuildResult<Option<String>> {
        let output = run_json_command(&self.command(
            "get-image",
            &["--image-build-version-arn", build_arn],
        ))
        .await
        .context("Cannot get image")?;
        Ok(select_image(output, self.region.as_deref()))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageListOutput {
    #[serde(default)]
    image_summary_list: Vec<ImageSummary>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageSummary {
    arn: String,
    state: ImageState,
    date_created: String,
}

#[derive(Deserialize)]
struct ImageState {
    status: String,
    reason: Option<String>,
}

fn parse_status(status: &str) -> BuildStatus {
    match status {
        "PENDING" | "CREATING" | "BUILDING" | "TESTING" | "DISTRIBUTING" | "INTEGRATING" => {
            BuildStatus::InProgress
        }
        "AVAILABLE" => BuildStatus::Succeeded,
        "FAILED" => BuildStatus::Failed,
        "CANCELLED" => BuildStatus::Cancelled,
        other => BuildStatus::Other(other.to_string()),
    }
}

fn parse_builds(output: ImageListOutput) -> BuildResult<Vec<BuildInfo>> {
    let mut builds = Vec::with_capacity(output.image_summary_list.len());
    for image in output.image_summary_list {
        let created_at = match parse_timestamp(&image.date_created) {
            Ok(created_at) => created_at,
            Err(error) => {
                log::warn!("Skipping build {}: {error}", image.arn);
                continue;
            }
        };
        builds.push(BuildInfo {
            status: parse_status(&image.state.status),
            reason: image.state.reason,
            build_id: image.arn,
            created_at,
        });
    }
    Ok(builds)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetImageOutput {
    image: Image,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Image {
    output_resources: Option<OutputResources>,
}

#[derive(Deserialize)]
struct OutputResources {
    #[serde(default)]
    amis: Vec<Ami>,
}

#[derive(Deserialize)]
struct Ami {
    region: Option<String>,
    image: Option<String>,
}

fn select_image(output: GetImageOutput, region: Option<&str>) -> Option<String> {
    let amis: Vec<Ami> = output
        .image
        .output_resources
        .map(|resources| resources.amis)
        .unwrap_or_default()
        .into_iter()
        .filter(|ami| ami.image.is_some())
        .collect();
    let preferred = amis
        .iter()
        .position(|ami| region.is_some() && ami.region.as_deref() == region)
        .unwrap_or(0);
    amis.into_iter().nth(preferred).and_then(|ami| ami.image)
}

impl BuildPipelineHandler for ImageBuilderHandler {
    fn find_pipeline<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BuildResult<Option<String>>> {
        Box::pin(self.pipeline_by_name(name))
    }

    fn list_builds<'a>(&'a self, pipeline_id: &'a str) -> BoxFuture<'a, BuildResult<Vec<BuildInfo>>> {
        Box::pin(self.pipeline_builds(pipeline_id))
    }

    fn build_image<'a>(&'a self, build_id: &'a str) -> BoxFuture<'a, BuildResult<Option<String>>> {
        Box::pin(self.image_of_build(build_id))
    }
}
