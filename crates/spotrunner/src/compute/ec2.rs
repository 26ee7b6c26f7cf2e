//! EC2 handler driven through the AWS command line interface.
use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::Map;
use crate::common::clock::ClockRef;
use crate::common::command::{error_has_code, run_command, run_json_command};
use crate::common::config::ComputeConfig;
use crate::compute::tags::TAG_JOB_ID;
use crate::compute::{
    ComputeHandler, ComputeResult, FleetRequest, InstanceRequirements, InstanceState,
    LaunchSpec, LaunchedInstance, OnDemandRequest, TaggedInstance, TerminateOutcome,
};

const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";

pub struct Ec2Handler {
    config: ComputeConfig,
    clock: ClockRef,
}

impl Ec2Handler {
    pub fn new(config: ComputeConfig, clock: ClockRef) -> Self {
        Self { config, clock }
    }

    fn command(&self, subcommand: &str, args: &[&str]) -> Vec<String> {
        let mut command = self.config.aws_cli.clone();
        command.push("ec2".to_string());
        command.push(subcommand.to_string());
        command.extend(args.iter().map(|arg| arg.to_string()));
        command.extend(["--output".to_string(), "json".to_string()]);
        if let Some(region) = &self.config.region {
            command.extend(["--region".to_string(), region.clone()]);
        }
        command
    }

    /// Settings shared by launch templates and direct launches.
    fn instance_settings(&self, spec: &LaunchSpec) -> serde_json::Map<String, Value> {
        let tags: Vec<Value> = spec
            .tags
            .iter()
            .map(|(key, value)| json!({"Key": key, "Value": value}))
            .collect();
        let mut settings = serde_json::Map::new();
        settings.insert("ImageId".to_string(), json!(spec.image_id));
        settings.insert(
            "BlockDeviceMappings".to_string(),
            json!([{
                "DeviceName": self.config.root_device_name,
                "Ebs": {
                    "VolumeSize": spec.disk_size_gb,
                    "VolumeType": "gp3",
                    "DeleteOnTermination": true
                }
            }]),
        );
        settings.insert(
            "InstanceInitiatedShutdownBehavior".to_string(),
            json!("terminate"),
        );
        settings.insert(
            "MetadataOptions".to_string(),
            json!({"HttpTokens": "required", "HttpEndpoint": "enabled"}),
        );
        settings.insert(
            "TagSpecifications".to_string(),
            json!([
                {"ResourceType": "instance", "Tags": tags},
                {"ResourceType": "volume", "Tags": tags}
            ]),
        );
        if !self.config.security_groups.is_empty() {
            settings.insert(
                "SecurityGroupIds".to_string(),
                json!(self.config.security_groups),
            );
        }
        if let Some(profile) = &self.config.instance_profile {
            settings.insert("IamInstanceProfile".to_string(), json!({"Name": profile}));
        }
        if let Some(key_name) = &self.config.key_name {
            settings.insert("KeyName".to_string(), json!(key_name));
        }
        settings
    }

    fn launch_template_data(&self, spec: &LaunchSpec) -> Value {
        let mut data = self.instance_settings(spec);
        // Launch templates expect encoded user data
        data.insert("UserData".to_string(), json!(BASE64.encode(&spec.user_data)));
        Value::Object(data)
    }

    fn run_instances_input(&self, request: &OnDemandRequest) -> Value {
        let mut input = self.instance_settings(&request.spec);
        // The CLI encodes user data of direct launches itself
        input.insert("UserData".to_string(), json!(request.spec.user_data));
        input.insert("InstanceType".to_string(), json!(request.instance_type));
        input.insert("MinCount".to_string(), json!(1));
        input.insert("MaxCount".to_string(), json!(1));
        if let Some(subnet) = self.config.subnets.first() {
            input.insert("SubnetId".to_string(), json!(subnet));
        }
        Value::Object(input)
    }

    fn fleet_overrides(&self, request: &FleetRequest) -> Vec<Value> {
        let shapes: Vec<Value> = match request.requirements {
            Some(requirements) => vec![json!({
                "InstanceRequirements": instance_requirements(requirements)
            })],
            None => request
                .instance_types
                .iter()
                .map(|instance_type| json!({"InstanceType": instance_type}))
                .collect(),
        };
        let mut overrides = vec![];
        for shape in shapes {
            if self.config.subnets.is_empty() {
                overrides.push(with_image(shape, &request.spec.image_id));
                continue;
            }
            for subnet in &self.config.subnets {
                let mut item = shape.clone();
                item["SubnetId"] = json!(subnet);
                overrides.push(with_image(item, &request.spec.image_id));
            }
        }
        overrides
    }

    fn fleet_input(&self, request: &FleetRequest, launch_template_id: &str) -> Value {
        json!({
            "Type": "instant",
            "TargetCapacitySpecification": {
                "TotalTargetCapacity": 1,
                "SpotTargetCapacity": 1,
                "DefaultTargetCapacityType": "spot"
            },
            "SpotOptions": {
                "AllocationStrategy": "capacity-optimized",
                "InstanceInterruptionBehavior": "terminate"
            },
            "LaunchTemplateConfigs": [{
                "LaunchTemplateSpecification": {
                    "LaunchTemplateId": launch_template_id,
                    "Version": "$Latest"
                },
                "Overrides": self.fleet_overrides(request)
            }]
        })
    }

    fn launch_template_name(&self, spec: &LaunchSpec) -> String {
        format!(
            "spotrunner-{}-{}",
            spec.job_id,
            self.clock.now().timestamp_millis()
        )
    }

    async fn create_launch_template(&self, spec: &LaunchSpec) -> ComputeResult<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Output {
            launch_template: LaunchTemplate,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct LaunchTemplate {
            launch_template_id: String,
        }

        let name = self.launch_template_name(spec);
        let data = self.launch_template_data(spec).to_string();
        let output: Output = run_json_command(&self.command(
            "create-launch-template",
            &["--launch-template-name", &name, "--launch-template-data", &data],
        ))
        .await
        .context("Cannot create launch template")?;
        Ok(output.launch_template.launch_template_id)
    }

    async fn delete_launch_template(&self, launch_template_id: &str) {
        let command = self.command(
            "delete-launch-template",
            &["--launch-template-id", launch_template_id],
        );
        if let Err(error) = run_command(&command).await {
            log::warn!("Cannot delete launch template {launch_template_id}: {error:?}");
        }
    }

    async fn request_fleet(&self, request: &FleetRequest) -> ComputeResult<Option<LaunchedInstance>> {
        let launch_template_id = self.create_launch_template(&request.spec).await?;
        let input = self.fleet_input(request, &launch_template_id).to_string();
        let result = run_command(&self.command("create-fleet", &["--cli-input-json", &input]))
            .await
            .context("Cannot create fleet")
            .and_then(|output| parse_fleet_output(&output));
        self.delete_launch_template(&launch_template_id).await;
        result
    }

    async fn launch_on_demand(&self, request: &OnDemandRequest) -> ComputeResult<LaunchedInstance> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Output {
            instances: Vec<Instance>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Instance {
            instance_id: String,
            instance_type: String,
        }

        let input = self.run_instances_input(request).to_string();
        let output: Output =
            run_json_command(&self.command("run-instances", &["--cli-input-json", &input]))
                .await
                .context("Cannot run instance")?;
        let instance = output
            .instances
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No instance was launched"))?;
        Ok(LaunchedInstance {
            instance_id: instance.instance_id,
            instance_type: instance.instance_type,
        })
    }

    async fn terminate(&self, instance_id: &str) -> ComputeResult<TerminateOutcome> {
        let command = self.command("terminate-instances", &["--instance-ids", instance_id]);
        match run_command(&command).await {
            Ok(_) => Ok(TerminateOutcome::Terminated),
            Err(error) if error_has_code(&error, INSTANCE_NOT_FOUND) => {
                Ok(TerminateOutcome::AlreadyGone)
            }
            Err(error) => Err(error.context(format!("Cannot terminate instance {instance_id}"))),
        }
    }

    async fn describe_tagged(&self) -> ComputeResult<Vec<TaggedInstance>> {
        let filter = format!("Name=tag-key,Values={TAG_JOB_ID}");
        let output = run_command(&self.command("describe-instances", &["--filters", &filter]))
            .await
            .context("Cannot describe instances")?;
        parse_describe_output(&output)
    }
}

fn with_image(mut item: Value, image_id: &str) -> Value {
    item["ImageId"] = json!(image_id);
    item
}

fn instance_requirements(requirements: InstanceRequirements) -> Value {
    let vcpu = match requirements.vcpu {
        Some(vcpu) => json!({"Min": vcpu, "Max": vcpu}),
        None => json!({"Min": 0}),
    };
    let memory = json!({"Min": requirements.memory_gib.unwrap_or(0).saturating_mul(1024)});
    json!({"VCpuCount": vcpu, "MemoryMiB": memory})
}

fn parse_fleet_output(output: &str) -> ComputeResult<Option<LaunchedInstance>> {
    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct Output {
        #[serde(default)]
        instances: Vec<FleetInstances>,
        #[serde(default)]
        errors: Vec<FleetError>,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct FleetInstances {
        #[serde(default)]
        instance_ids: Vec<String>,
        instance_type: Option<String>,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct FleetError {
        error_code: Option<String>,
        error_message: Option<String>,
    }

    let output: Output = serde_json::from_str(output).context("Cannot parse fleet output")?;
    for error in &output.errors {
        log::debug!(
            "Fleet error {}: {}",
            error.error_code.as_deref().unwrap_or("unknown"),
            error.error_message.as_deref().unwrap_or_default()
        );
    }
    let launched = output.instances.into_iter().find_map(|instances| {
        let instance_id = instances.instance_ids.into_iter().next()?;
        Some(LaunchedInstance {
            instance_id,
            instance_type: instances.instance_type.unwrap_or_default(),
        })
    });
    if launched.is_none() && !output.errors.is_empty() {
        log::warn!(
            "Fleet launched no instance ({} errors)",
            output.errors.len()
        );
    }
    Ok(launched)
}

fn parse_describe_output(output: &str) -> ComputeResult<Vec<TaggedInstance>> {
    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct Output {
        #[serde(default)]
        reservations: Vec<Reservation>,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct Reservation {
        #[serde(default)]
        instances: Vec<Instance>,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct Instance {
        instance_id: String,
        state: State,
        state_reason: Option<StateReason>,
        launch_time: DateTime<Utc>,
        #[serde(default)]
        tags: Vec<Tag>,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct State {
        name: String,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct StateReason {
        code: Option<String>,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct Tag {
        key: String,
        value: String,
    }

    let output: Output =
        serde_json::from_str(output).context("Cannot parse describe-instances output")?;
    let mut instances = vec![];
    for instance in output.reservations.into_iter().flat_map(|r| r.instances) {
        let Some(state) = InstanceState::parse(&instance.state.name) else {
            log::warn!(
                "Unknown state `{}` of instance {}",
                instance.state.name,
                instance.instance_id
            );
            continue;
        };
        instances.push(TaggedInstance {
            instance_id: instance.instance_id,
            state,
            state_reason: instance.state_reason.and_then(|reason| reason.code),
            launch_time: instance.launch_time,
            tags: instance
                .tags
                .into_iter()
                .map(|tag| (tag.key, tag.value))
                .collect::<Map<_, _>>(),
        });
    }
    Ok(instances)
}

impl ComputeHandler for Ec2Handler {
    fn create_fleet<'a>(
        &'a self,
        request: &'a FleetRequest,
    ) -> BoxFuture<'a, ComputeResult<Option<LaunchedInstance>>> {
        Box::pin(self.request_fleet(request))
    }

    fn run_instance<'a>(
        &'a self,
        request: &'a OnDemandRequest,
    ) -> BoxFuture<'a, ComputeResult<LaunchedInstance>> {
        Box::pin(self.launch_on_demand(request))
    }

    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BoxFuture<'a, ComputeResult<TerminateOutcome>> {
        Box::pin(self.terminate(instance_id))
    }

    fn list_tagged_instances(&self) -> BoxFuture<'_, ComputeResult<Vec<TaggedInstance>>> {
        Box::pin(self.describe_tagged())
    }
}
