//! The application stack: a VPC and EKS cluster running ArgoCD, whose
//! ingress is exposed through an HTTP API gateway.
//!
//! The interesting part is the bridge between the cluster and the gateway.
//! The ingress gets a load balancer hostname only once the controller has
//! provisioned it; the load balancer name is parsed out of that hostname, the
//! load balancer and its listener are looked up by it, and the listener ARN
//! is what the gateway integration points at.

pub mod elb;

use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use crate::blueprint::Blueprint;
use crate::cell::ValueCell;
use crate::config::Settings;
use crate::core::Environment;
use crate::error::LookupError;
use crate::provider::{
    Attributes, ClusterApi, ClusterObject, Listener, LoadBalancer, PlatformQuery, ProvisioningBackend, ResourceSpec,
};
use crate::transform::try_lift;

const ARGOCD_NAMESPACE: &str = "argocd";
const CONTROLLER_NAMESPACE: &str = "kube-system";
const CONTROLLER_SERVICE_ACCOUNT: &str = "lb-aws-load-balancer-controller";
const EKSCTL_VERSION: &str = "1.27";

/// Everything the stack is provisioned through.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn ProvisioningBackend>,
    pub platform: Arc<dyn PlatformQuery>,
    pub cluster: Arc<dyn ClusterApi>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    pub vpc_id: String,
    pub private_subnet_ids: Vec<String>,
    pub public_subnet_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub kubeconfig: String,
    pub oidc_provider_arn: Option<String>,
    pub oidc_provider_url: Option<String>,
}

/// The cluster's IAM OIDC identity provider, which lets service accounts
/// assume IAM roles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OidcProvider {
    pub arn: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Api {
    pub id: String,
    pub endpoint: String,
}

/// Cells worth exporting once the stack is applied.
pub struct Stack {
    pub network: ValueCell<Network>,
    pub cluster: ValueCell<Cluster>,
    pub load_balancer_name: ValueCell<String>,
    pub listener: ValueCell<Listener>,
    pub integration_id: ValueCell<String>,
    pub api: ValueCell<Api>,
}

/// Declares the whole stack.
pub fn blueprint(settings: Settings, with: &Collaborators) -> (Blueprint<Settings>, Stack) {
    let name = settings.name.clone();
    let policy = settings.lookup.clone();
    let timeout = settings.timeout;

    let mut plan = Blueprint::new(Environment::new(name, settings)).with_retry_policy(policy);
    if let Some(timeout) = timeout {
        plan = plan.with_timeout(timeout);
    }

    let (network, cluster) = kubernetes(&mut plan, with);
    load_balancer_controller(&mut plan, with, &network, &cluster);
    gitops(&mut plan, with, &cluster);
    let (load_balancer_name, listener) = ingress(&mut plan, with);
    let (api, integration_id) = gateway(&mut plan, with, &network, &listener);

    let stack = Stack {
        network,
        cluster,
        load_balancer_name,
        listener,
        integration_id,
        api,
    };
    (plan, stack)
}

/// VPC and EKS cluster with its namespaces.
fn kubernetes(plan: &mut Blueprint<Settings>, with: &Collaborators) -> (ValueCell<Network>, ValueCell<Cluster>) {
    let backend = with.backend.clone();
    let network = plan.resource("vpc").run(move |ctx| {
        let backend = backend.clone();
        async move {
            let cluster = ctx.scoped("cluster");
            let spec = ResourceSpec::new("awsx:ec2:Vpc", ctx.scoped("vpc")).with_properties(json!({
                "numberOfAvailabilityZones": 2,
                "cidrBlock": "172.16.0.0/24",
                "tags": {
                    "alpha.eksctl.io/cluster-name": cluster,
                    "alpha.eksctl.io/cluster-oidc-enabled": "false",
                    "eksctl.cluster.k8s.io/v1alpha1/cluster-name": cluster,
                    "alpha.eksctl.io/eksctl-version": EKSCTL_VERSION,
                    "Name": format!("{cluster}/VPC"),
                },
            }));
            let attrs = provision(&*backend, spec).await?;
            Ok(Network {
                vpc_id: attr(&attrs, "vpcId")?,
                private_subnet_ids: attr_list(&attrs, "privateSubnetIds")?,
                public_subnet_ids: attr_list(&attrs, "publicSubnetIds")?,
            })
        }
    });

    let backend = with.backend.clone();
    let cluster = plan
        .resource("cluster")
        .using(network.clone())
        .run(move |ctx, network| {
            let backend = backend.clone();
            async move {
                let name = ctx.scoped("cluster");
                let settings = ctx.data();
                let user_pool = format!(
                    "arn:aws:cognito-idp:{}:{}:userpool/{}",
                    settings.region,
                    settings.account_id.as_deref().unwrap_or("*"),
                    settings.cognito_user_pool_id,
                );
                let spec = ResourceSpec::new("eks:index:Cluster", &name).with_properties(json!({
                    "name": name,
                    "vpcId": network.vpc_id,
                    "privateSubnetIds": first_two(&network.private_subnet_ids)?,
                    "publicSubnetIds": first_two(&network.public_subnet_ids)?,
                    "instanceType": "t2.medium",
                    "desiredCapacity": 2,
                    "minSize": 1,
                    "maxSize": 2,
                    "createOidcProvider": true,
                    "roleManagedPolicies": [
                        "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy",
                        "arn:aws:iam::aws:policy/AmazonEKSVPCResourceController",
                    ],
                    "rolePolicies": {
                        "PolicyELBPermissions": allow(&[
                            "ec2:DescribeAccountAttributes",
                            "ec2:DescribeAddresses",
                            "ec2:DescribeInternetGateways",
                        ], "*"),
                    },
                    "instanceRoleManagedPolicies": [
                        "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
                        "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy",
                        "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
                        "arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore",
                    ],
                    "instanceRolePolicies": {
                        "cognitoIdpPolicy": allow(&["cognito-idp:AdminInitiateAuth"], &user_pool),
                        "elasticloadbalancingPolicy": allow(&["elasticloadbalancing:DescribeLoadBalancers"], "*"),
                    },
                    "tags": {
                        "alpha.eksctl.io/cluster-name": name,
                        "eksctl.cluster.k8s.io/v1alpha1/cluster-name": name,
                        "alpha.eksctl.io/cluster-oidc-enabled": "true",
                        "alpha.eksctl.io/eksctl-version": EKSCTL_VERSION,
                        "Name": format!("{name}/ControlPlane"),
                    },
                }));
                let attrs = provision(&*backend, spec).await?;
                let optional = |key: &str| attrs.get(key).and_then(Value::as_str).map(str::to_owned);
                Ok(Cluster {
                    kubeconfig: attr(&attrs, "kubeconfig")?,
                    oidc_provider_arn: optional("oidcProviderArn"),
                    oidc_provider_url: optional("oidcProviderUrl"),
                    name,
                })
            }
        });

    for (node, namespace) in [
        ("argocd-namespace", ARGOCD_NAMESPACE.to_owned()),
        ("app-namespace", plan.env().data.ingress.namespace.clone()),
    ] {
        let api = with.cluster.clone();
        plan.resource(node).using(cluster.clone()).run(move |_, _| {
            let api = api.clone();
            let object = ClusterObject::new("v1", "Namespace", namespace.clone());
            async move { apply(&*api, object).await }
        });
    }

    // Every subnet is tagged so the load balancer controller can discover it.
    let backend = with.backend.clone();
    plan.resource("subnet-tags")
        .using(network.clone())
        .run(move |ctx, network| {
            let backend = backend.clone();
            async move {
                let cluster = ctx.scoped("cluster");
                let subnets = network.private_subnet_ids.iter().chain(&network.public_subnet_ids);
                for subnet in subnets {
                    for (key, value) in subnet_tags(&cluster, subnet) {
                        let spec = ResourceSpec::new("aws:ec2/tag:Tag", format!("{subnet}-{key}"))
                            .with_properties(json!({ "resourceId": subnet, "key": key, "value": value }));
                        provision(&*backend, spec).await?;
                    }
                }
                Ok(())
            }
        });

    (network, cluster)
}

fn subnet_tags(cluster: &str, subnet: &str) -> [(String, String); 8] {
    [
        (format!("kubernetes.io/cluster/{cluster}"), "shared".into()),
        ("kubernetes.io/role/internal-elb".into(), "1".into()),
        ("kubernetes.io/role/elb".into(), "1".into()),
        ("alpha.eksctl.io/cluster-name".into(), cluster.into()),
        ("alpha.eksctl.io/cluster-oidc-enabled".into(), "false".into()),
        ("eksctl.cluster.k8s.io/v1alpha1/cluster-name".into(), cluster.into()),
        ("alpha.eksctl.io/eksctl-version".into(), EKSCTL_VERSION.into()),
        ("Name".into(), format!("{cluster}/{subnet}")),
    ]
}

/// The AWS load balancer controller, which turns the ingress into an
/// application load balancer. It runs under an IAM role its service account
/// assumes through the cluster's OIDC provider.
fn load_balancer_controller(
    plan: &mut Blueprint<Settings>,
    with: &Collaborators,
    network: &ValueCell<Network>,
    cluster: &ValueCell<Cluster>,
) {
    let oidc = try_lift("cluster-oidc", cluster.clone(), |cluster| {
        match (&cluster.oidc_provider_arn, &cluster.oidc_provider_url) {
            (Some(arn), Some(url)) => Ok(OidcProvider {
                arn: arn.clone(),
                url: url.clone(),
            }),
            _ => anyhow::bail!("Cluster '{}' has no OIDC provider", cluster.name),
        }
    });

    let backend = with.backend.clone();
    let role_arn = plan
        .resource("lb-controller-role")
        .using(oidc)
        .run(move |ctx, oidc| {
            let backend = backend.clone();
            async move {
                let role = ResourceSpec::new("aws:iam/role:Role", ctx.scoped("lb-controller-role"))
                    .with_properties(json!({ "assumeRolePolicy": controller_trust_policy(&oidc) }));
                let role = provision(&*backend, role).await?;

                let policy = ResourceSpec::new("aws:iam/policy:Policy", ctx.scoped("lb-controller-policy"))
                    .with_properties(json!({ "policy": controller_policy() }));
                let policy = provision(&*backend, policy).await?;

                let attachment = ResourceSpec::new(
                    "aws:iam/rolePolicyAttachment:RolePolicyAttachment",
                    ctx.scoped("lb-controller-attachment"),
                )
                .with_properties(json!({ "role": attr(&role, "name")?, "policyArn": attr(&policy, "arn")? }));
                provision(&*backend, attachment).await?;

                attr(&role, "arn")
            }
        });

    let backend = with.backend.clone();
    plan.resource("lb-controller-chart")
        .after(["subnet-tags"])
        .using((network.clone(), cluster.clone(), role_arn))
        .run(move |ctx, (network, cluster, role_arn)| {
            let backend = backend.clone();
            async move {
                let spec = ResourceSpec::new("kubernetes:helm.sh/v3:Chart", "lb").with_properties(json!({
                    "chart": "aws-load-balancer-controller",
                    "fetchOpts": { "repo": "https://aws.github.io/eks-charts" },
                    "namespace": CONTROLLER_NAMESPACE,
                    "values": {
                        "region": ctx.data().region,
                        "serviceAccount": {
                            "create": true,
                            "name": CONTROLLER_SERVICE_ACCOUNT,
                            "annotations": { "eks.amazonaws.com/role-arn": *role_arn },
                        },
                        "vpcId": network.vpc_id,
                        "clusterName": cluster.name,
                        "podLabels": { "stack": ctx.env.stack, "app": CONTROLLER_NAMESPACE },
                    },
                }));
                provision(&*backend, spec).await?;
                Ok(())
            }
        });
}

/// Lets the controller's service account assume its role.
fn controller_trust_policy(oidc: &OidcProvider) -> Value {
    let issuer = oidc.url.trim_start_matches("https://");
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Federated": oidc.arn },
            "Action": "sts:AssumeRoleWithWebIdentity",
            "Condition": {
                "StringEquals": {
                    format!("{issuer}:sub"): format!("system:serviceaccount:{CONTROLLER_NAMESPACE}:{CONTROLLER_SERVICE_ACCOUNT}"),
                    format!("{issuer}:aud"): "sts.amazonaws.com",
                }
            },
        }],
    })
}

/// What the controller needs to manage load balancers for ingresses.
fn controller_policy() -> Value {
    allow(
        &[
            "ec2:DescribeAvailabilityZones",
            "ec2:DescribeInstances",
            "ec2:DescribeSecurityGroups",
            "ec2:DescribeSubnets",
            "ec2:DescribeVpcs",
            "ec2:CreateSecurityGroup",
            "ec2:AuthorizeSecurityGroupIngress",
            "ec2:RevokeSecurityGroupIngress",
            "ec2:CreateTags",
            "elasticloadbalancing:*",
            "iam:CreateServiceLinkedRole",
            "acm:DescribeCertificate",
            "acm:ListCertificates",
        ],
        "*",
    )
}

/// A policy document allowing `actions` on `resource`.
fn allow(actions: &[&str], resource: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{ "Effect": "Allow", "Action": actions, "Resource": resource }],
    })
}

/// ArgoCD, the secrets the application needs and the ArgoCD application.
fn gitops(plan: &mut Blueprint<Settings>, with: &Collaborators, cluster: &ValueCell<Cluster>) {
    let backend = with.backend.clone();
    plan.resource("argocd-chart")
        .after(["argocd-namespace"])
        .using(cluster.clone())
        .run(move |_, _| {
            let backend = backend.clone();
            async move {
                let spec = ResourceSpec::new("kubernetes:helm.sh/v3:Chart", "argocd").with_properties(json!({
                    "chart": "argo-cd",
                    "fetchOpts": { "repo": "https://argoproj.github.io/argo-helm" },
                    "version": "3.9.0",
                    "namespace": ARGOCD_NAMESPACE,
                }));
                provision(&*backend, spec).await?;
                Ok(())
            }
        });

    let api = with.cluster.clone();
    plan.resource("docker-secret")
        .after(["app-namespace"])
        .run(move |ctx| {
            let api = api.clone();
            async move {
                let settings = ctx.data();
                let config = registry_config(&settings.docker_registry_username, &settings.github_token);
                let object = ClusterObject::new("v1", "Secret", "ghcr-secret")
                    .in_namespace(&settings.ingress.namespace)
                    .with_body(json!({
                        "type": "kubernetes.io/dockerconfigjson",
                        "stringData": { ".dockerconfigjson": config.to_string() },
                    }));
                apply(&*api, object).await
            }
        });

    let api = with.cluster.clone();
    plan.resource("cognito-secret")
        .after(["app-namespace"])
        .run(move |ctx| {
            let api = api.clone();
            async move {
                let settings = ctx.data();
                let object = ClusterObject::new("v1", "Secret", "cognito-secret")
                    .in_namespace(&settings.ingress.namespace)
                    .with_body(json!({
                        "stringData": {
                            "AWS_REGION": settings.region,
                            "AWS_COGNITO_USER_POOL_ID": settings.cognito_user_pool_id,
                            "AWS_COGNITO_CLIENT_ID": settings.cognito_client_id,
                        }
                    }));
                apply(&*api, object).await
            }
        });

    let api = with.cluster.clone();
    plan.resource("argocd-app")
        .after(["argocd-chart", "docker-secret", "cognito-secret"])
        .run(move |ctx| {
            let api = api.clone();
            async move {
                let object = ClusterObject::new("argoproj.io/v1alpha1", "Application", "afj-test-argo")
                    .in_namespace(ARGOCD_NAMESPACE)
                    .with_body(json!({
                        "spec": {
                            "source": {
                                "repoURL": "https://github.com/VeriDID/afj-test-pulumi-k8s-config.git",
                                "targetRevision": "HEAD",
                                "path": "dev",
                            },
                            "destination": {
                                "server": "https://kubernetes.default.svc",
                                "namespace": ctx.data().ingress.namespace,
                            },
                            "project": "default",
                            "syncPolicy": {
                                "automated": { "prune": true, "selfHeal": true },
                                "syncOptions": ["CreateNamespace=true"],
                            },
                        }
                    }));
                apply(&*api, object).await
            }
        });
}

/// The ingress, and the chain from its hostname to the load balancer's
/// listener.
fn ingress(plan: &mut Blueprint<Settings>, with: &Collaborators) -> (ValueCell<String>, ValueCell<Listener>) {
    let api = with.cluster.clone();
    let ingress = plan
        .resource("ingress")
        .after(["argocd-app", "lb-controller-chart"])
        .run(move |ctx| {
            let api = api.clone();
            async move {
                let settings = &ctx.data().ingress;
                let object = ClusterObject::new("networking.k8s.io/v1", "Ingress", &settings.name)
                    .in_namespace(&settings.namespace)
                    .with_body(json!({
                        "metadata": {
                            "annotations": {
                                "alb.ingress.kubernetes.io/load-balancer-name": settings.name,
                                "alb.ingress.kubernetes.io/target-type": "ip",
                                "alb.ingress.kubernetes.io/scheme": "internal",
                                "alb.ingress.kubernetes.io/healthcheck-path": "/",
                            }
                        },
                        "spec": {
                            "ingressClassName": "alb",
                            "rules": [{
                                "http": {
                                    "paths": [{
                                        "path": "/",
                                        "pathType": "Prefix",
                                        "backend": {
                                            "service": {
                                                "name": "afj-test-service",
                                                "port": { "name": "svc-port" },
                                            }
                                        }
                                    }]
                                }
                            }]
                        }
                    }));
                api.apply(&object).await?;
                Ok(object)
            }
        });

    // The controller assigns the hostname some time after the ingress exists.
    let api = with.cluster.clone();
    let hostname = plan.lookup("ingress-hostname").using(ingress).run(move |object| {
        let api = api.clone();
        async move {
            let status = api
                .observe(&object)
                .await
                .map_err(|err| LookupError::Transient(format!("{err:#}")))?;
            status
                .load_balancer_hostname()
                .map(str::to_owned)
                .ok_or_else(|| LookupError::NotFound(format!("no hostname on ingress '{}' yet", object.name)))
        }
    });

    let settings = &plan.env().data.ingress;
    let prefix = plan.constant("load-balancer-prefix", settings.load_balancer_prefix.clone());
    let port = plan.constant("listener-port", settings.listener_port);

    let name = try_lift("load-balancer-name", (hostname, prefix), |(hostname, prefix)| {
        Ok(elb::load_balancer_name(&hostname, &prefix)?)
    });

    let platform = with.platform.clone();
    let load_balancer: ValueCell<LoadBalancer> = plan.lookup("load-balancer").using(name.clone()).run(move |name| {
        let platform = platform.clone();
        async move { platform.find_load_balancer(&name).await }
    });

    let platform = with.platform.clone();
    let listener = plan
        .lookup("listener")
        .using((load_balancer, port))
        .run(move |(load_balancer, port)| {
            let platform = platform.clone();
            async move { platform.find_listener(&load_balancer.arn, *port).await }
        });

    (name, listener)
}

/// The HTTP API, its VPC link into the cluster network and the routes.
fn gateway(
    plan: &mut Blueprint<Settings>,
    with: &Collaborators,
    network: &ValueCell<Network>,
    listener: &ValueCell<Listener>,
) -> (ValueCell<Api>, ValueCell<String>) {
    let backend = with.backend.clone();
    let security_group = plan
        .resource("vpc-link-sg")
        .using(network.clone())
        .run(move |ctx, network| {
            let backend = backend.clone();
            async move {
                let name = ctx.scoped("sg");
                let spec = ResourceSpec::new("aws:ec2/securityGroup:SecurityGroup", &name).with_properties(json!({
                    "vpcId": network.vpc_id,
                    "description": "Security Group for VPC Link",
                    "tags": { "Name": name },
                    "egress": [{
                        "protocol": "-1",
                        "fromPort": 0,
                        "toPort": 0,
                        "cidrBlocks": ["0.0.0.0/0"],
                    }],
                }));
                attr(&provision(&*backend, spec).await?, "id")
            }
        });

    let backend = with.backend.clone();
    let api = plan.resource("api").run(move |ctx| {
        let backend = backend.clone();
        async move {
            let spec = ResourceSpec::new("aws:apigatewayv2/api:Api", ctx.scoped("api"))
                .with_properties(json!({ "protocolType": "HTTP" }));
            let attrs = provision(&*backend, spec).await?;
            Ok(Api {
                id: attr(&attrs, "id")?,
                endpoint: attr(&attrs, "apiEndpoint")?,
            })
        }
    });

    let backend = with.backend.clone();
    let vpc_link = plan
        .resource("vpc-link")
        .using((network.clone(), security_group))
        .run(move |ctx, (network, security_group)| {
            let backend = backend.clone();
            async move {
                let spec = ResourceSpec::new("aws:apigatewayv2/vpcLink:VpcLink", ctx.scoped("vpc-link"))
                    .with_properties(json!({
                        "subnetIds": network.private_subnet_ids,
                        "securityGroupIds": [*security_group],
                        "tags": {
                            "services.k8s.aws/controller-version": "apigatewayv2-v0.1.5",
                            "services.k8s.aws/namespace": ctx.data().ingress.namespace,
                        },
                    }));
                attr(&provision(&*backend, spec).await?, "id")
            }
        });

    let backend = with.backend.clone();
    let integration = plan
        .resource("gateway-integration")
        .after(["vpc-link-sg"])
        .using((api.clone(), vpc_link, listener.clone()))
        .run(move |ctx, (api, vpc_link, listener)| {
            let backend = backend.clone();
            async move {
                let spec = ResourceSpec::new("aws:apigatewayv2/integration:Integration", ctx.scoped("integration"))
                    .with_properties(json!({
                        "apiId": api.id,
                        "integrationType": "HTTP_PROXY",
                        "integrationMethod": "ANY",
                        "integrationUri": listener.arn,
                        "payloadFormatVersion": "1.0",
                        "connectionType": "VPC_LINK",
                        "connectionId": *vpc_link,
                    }));
                attr(&provision(&*backend, spec).await?, "id")
            }
        });

    let backend = with.backend.clone();
    let authorizer = plan
        .resource("authorizer")
        .after(["gateway-integration"])
        .using(api.clone())
        .run(move |ctx, api| {
            let backend = backend.clone();
            async move {
                let name = ctx.scoped("authorizer");
                let spec = ResourceSpec::new("aws:apigatewayv2/authorizer:Authorizer", &name).with_properties(json!({
                    "apiId": api.id,
                    "authorizerType": "JWT",
                    "identitySources": ["$request.header.Authorization"],
                    "jwtConfiguration": {
                        "issuer": ctx.data().jwt_issuer(),
                        "audiences": [ctx.data().cognito_client_id],
                    },
                    "authorizerResultTtlInSeconds": 0,
                    "name": name,
                }));
                attr(&provision(&*backend, spec).await?, "id")
            }
        });

    let backend = with.backend.clone();
    plan.resource("routes")
        .using((api.clone(), integration.clone(), authorizer))
        .run(move |ctx, (api, integration, authorizer)| {
            let backend = backend.clone();
            async move {
                let target = format!("integrations/{integration}");
                let routes = [
                    ("route-get-root", "GET /", None),
                    ("route-auth-log-in", "POST /auth/login", None),
                    ("route-auth-log-out", "POST /auth/logout", Some(authorizer.as_str())),
                ];

                let mut ids = Vec::with_capacity(routes.len());
                for (name, key, authorizer) in routes {
                    let mut properties = json!({ "apiId": api.id, "routeKey": key, "target": target });
                    if let Some(authorizer) = authorizer {
                        properties["authorizerId"] = json!(authorizer);
                        properties["authorizationType"] = json!("JWT");
                    }
                    let spec = ResourceSpec::new("aws:apigatewayv2/route:Route", ctx.scoped(name))
                        .with_properties(properties);
                    ids.push(attr(&provision(&*backend, spec).await?, "id")?);
                }
                Ok(ids)
            }
        });

    let backend = with.backend.clone();
    let deployment = plan
        .resource("deployment")
        .after(["routes"])
        .using(api.clone())
        .run(move |ctx, api| {
            let backend = backend.clone();
            async move {
                let spec = ResourceSpec::new("aws:apigatewayv2/deployment:Deployment", ctx.scoped("deployment"))
                    .with_properties(json!({ "apiId": api.id }));
                attr(&provision(&*backend, spec).await?, "id")
            }
        });

    let backend = with.backend.clone();
    plan.resource("stage")
        .using((api.clone(), deployment))
        .run(move |ctx, (api, deployment)| {
            let backend = backend.clone();
            async move {
                let spec = ResourceSpec::new("aws:apigatewayv2/stage:Stage", ctx.scoped("stage")).with_properties(json!({
                    "apiId": api.id,
                    "deploymentId": *deployment,
                    "autoDeploy": true,
                    "name": "$default",
                }));
                provision(&*backend, spec).await?;
                Ok(())
            }
        });

    (api, integration)
}

/// Contents of a `kubernetes.io/dockerconfigjson` secret for the GitHub
/// container registry.
fn registry_config(username: &str, token: &str) -> Value {
    json!({
        "auths": {
            "ghcr.io": {
                "username": username,
                "password": token,
                "auth": STANDARD.encode(format!("{username}:{token}")),
            }
        }
    })
}

async fn provision(backend: &dyn ProvisioningBackend, spec: ResourceSpec) -> anyhow::Result<Attributes> {
    let handle = backend
        .create(&spec)
        .await
        .with_context(|| format!("Failed to create {} '{}'", spec.kind, spec.name))?;
    backend
        .observe(&handle)
        .await
        .with_context(|| format!("Failed to observe {} '{}'", handle.kind, handle.id))
}

async fn apply(api: &dyn ClusterApi, object: ClusterObject) -> anyhow::Result<()> {
    api.apply(&object)
        .await
        .with_context(|| format!("Failed to apply {} '{}'", object.kind, object.name))?;
    Ok(())
}

fn attr(attrs: &Attributes, key: &str) -> anyhow::Result<String> {
    attrs
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .with_context(|| format!("Missing attribute '{key}'"))
}

fn attr_list(attrs: &Attributes, key: &str) -> anyhow::Result<Vec<String>> {
    let list = attrs
        .get(key)
        .and_then(Value::as_array)
        .with_context(|| format!("Missing attribute '{key}'"))?;
    list.iter()
        .map(|value| value.as_str().map(str::to_owned))
        .collect::<Option<Vec<_>>>()
        .with_context(|| format!("Attribute '{key}' is not a list of strings"))
}

fn first_two(ids: &[String]) -> anyhow::Result<&[String]> {
    ids.get(..2)
        .with_context(|| format!("Expected at least two subnets, got {}", ids.len()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::Outcome;
    use crate::error::Cause;
    use crate::node::NodeState;
    use crate::provider::{ObjectStatus, ResourceHandle};
    use crate::retry::RetryPolicy;

    const HOSTNAME: &str = "internal-afj-test-ingress-pulumi-1234567890.ca-central-1.elb.amazonaws.com";
    const LB_ARN: &str = "arn:aws:elasticloadbalancing:ca-central-1:123:loadbalancer/app/afj-test-ingress-pulumi/50dc6c";
    const OIDC_ARN: &str = "arn:aws:iam::123:oidc-provider/oidc.eks.ca-central-1.amazonaws.com/id/EXAMPLE";
    const OIDC_URL: &str = "https://oidc.eks.ca-central-1.amazonaws.com/id/EXAMPLE";

    #[derive(Default)]
    struct Backend {
        created: Mutex<Vec<ResourceSpec>>,
        without_oidc: bool,
    }

    impl Backend {
        fn created(&self) -> Vec<ResourceSpec> {
            self.created.lock().unwrap().clone()
        }

        fn position(&self, kind: &str) -> Option<usize> {
            self.created().iter().position(|spec| spec.kind.contains(kind))
        }

        fn spec(&self, kind: &str) -> Option<ResourceSpec> {
            self.created().into_iter().find(|spec| spec.kind == kind)
        }
    }

    #[async_trait]
    impl ProvisioningBackend for Backend {
        async fn create(&self, spec: &ResourceSpec) -> anyhow::Result<ResourceHandle> {
            self.created.lock().unwrap().push(spec.clone());
            Ok(ResourceHandle {
                kind: spec.kind.clone(),
                name: spec.name.clone(),
                id: format!("{}-id", spec.name),
            })
        }

        async fn observe(&self, handle: &ResourceHandle) -> anyhow::Result<Attributes> {
            let attrs = match handle.kind.as_str() {
                "awsx:ec2:Vpc" => json!({
                    "vpcId": "vpc-1",
                    "privateSubnetIds": ["subnet-a", "subnet-b", "subnet-c"],
                    "publicSubnetIds": ["subnet-d", "subnet-e"],
                }),
                "eks:index:Cluster" if self.without_oidc => json!({ "kubeconfig": "apiVersion: v1" }),
                "eks:index:Cluster" => json!({
                    "kubeconfig": "apiVersion: v1",
                    "oidcProviderArn": OIDC_ARN,
                    "oidcProviderUrl": OIDC_URL,
                }),
                "aws:apigatewayv2/api:Api" => json!({
                    "id": handle.id,
                    "apiEndpoint": "https://abc.execute-api.ca-central-1.amazonaws.com",
                }),
                _ => json!({
                    "id": handle.id,
                    "name": handle.name,
                    "arn": format!("arn:aws:iam::123:{}", handle.id),
                }),
            };
            match attrs {
                Value::Object(attrs) => Ok(attrs),
                _ => unreachable!(),
            }
        }
    }

    /// Reports the ingress hostname from the `ready_after`-th observation on.
    struct Kube {
        applied: Mutex<Vec<ClusterObject>>,
        observed: AtomicU32,
        ready_after: u32,
    }

    impl Kube {
        fn applied(&self, name: &str) -> Option<ClusterObject> {
            self.applied.lock().unwrap().iter().find(|object| object.name == name).cloned()
        }
    }

    #[async_trait]
    impl ClusterApi for Kube {
        async fn apply(&self, object: &ClusterObject) -> anyhow::Result<ObjectStatus> {
            self.applied.lock().unwrap().push(object.clone());
            Ok(ObjectStatus::default())
        }

        async fn observe(&self, _: &ClusterObject) -> anyhow::Result<ObjectStatus> {
            let n = self.observed.fetch_add(1, Ordering::SeqCst) + 1;
            if n < self.ready_after {
                return Ok(ObjectStatus(json!({ "status": { "loadBalancer": {} } })));
            }
            Ok(ObjectStatus(json!({
                "status": { "loadBalancer": { "ingress": [{ "hostname": HOSTNAME }] } }
            })))
        }
    }

    struct Platform {
        calls: AtomicU32,
        visible_after: u32,
        denied: bool,
    }

    #[async_trait]
    impl PlatformQuery for Platform {
        async fn find_load_balancer(&self, name: &str) -> Result<LoadBalancer, LookupError> {
            if self.denied {
                return Err(LookupError::PermissionDenied("elasticloadbalancing:DescribeLoadBalancers".into()));
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < self.visible_after {
                return Err(LookupError::NotFound(name.to_owned()));
            }
            assert_eq!(name, "afj-test-ingress-pulumi");
            Ok(LoadBalancer {
                name: name.to_owned(),
                arn: LB_ARN.to_owned(),
                dns_name: HOSTNAME.to_owned(),
            })
        }

        async fn find_listener(&self, load_balancer_arn: &str, port: u16) -> Result<Listener, LookupError> {
            Ok(Listener {
                arn: format!("{load_balancer_arn}/listener/{port}"),
                port,
            })
        }
    }

    fn settings() -> Settings {
        Settings {
            name: "veridid".into(),
            region: "ca-central-1".into(),
            account_id: None,
            cognito_user_pool_id: "ca-central-1_pool".into(),
            cognito_client_id: "client".into(),
            docker_registry_username: "veridid".into(),
            github_token: "token".into(),
            ingress: Default::default(),
            timeout: None,
            lookup: RetryPolicy::default(),
        }
    }

    fn collaborators(kube: Kube, platform: Platform) -> (Collaborators, Arc<Backend>) {
        with_backend(Backend::default(), Arc::new(kube), platform)
    }

    fn with_backend(backend: Backend, kube: Arc<Kube>, platform: Platform) -> (Collaborators, Arc<Backend>) {
        let backend = Arc::new(backend);
        let with = Collaborators {
            backend: backend.clone(),
            platform: Arc::new(platform),
            cluster: kube,
        };
        (with, backend)
    }

    fn kube(ready_after: u32) -> Kube {
        Kube {
            applied: Mutex::new(Vec::new()),
            observed: AtomicU32::new(0),
            ready_after,
        }
    }

    fn platform(visible_after: u32, denied: bool) -> Platform {
        Platform {
            calls: AtomicU32::new(0),
            visible_after,
            denied,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stack_applies() {
        let (with, backend) = collaborators(kube(2), platform(3, false));
        let (plan, stack) = blueprint(settings(), &with);

        let report = plan.finish().unwrap().run().await;

        assert_eq!(report.outcome(), Outcome::Completed, "{report}");
        assert_eq!(*stack.load_balancer_name.get().unwrap(), "afj-test-ingress-pulumi");
        assert_eq!(stack.listener.get().unwrap().arn, format!("{LB_ARN}/listener/80"));
        assert_eq!(*stack.integration_id.get().unwrap(), "veridid-integration-id");
        assert_eq!(stack.cluster.get().unwrap().name, "veridid-cluster");

        let integration = backend
            .created()
            .into_iter()
            .find(|spec| spec.kind.ends_with(":Integration"))
            .unwrap();
        assert_eq!(integration.properties["integrationUri"], format!("{LB_ARN}/listener/80"));
        assert_eq!(integration.properties["connectionId"], "veridid-vpc-link-id");

        let attempts = |label: &str| report.lookups.iter().find(|l| &*l.label == label).unwrap().attempts;
        assert_eq!(attempts("ingress-hostname"), 2);
        assert_eq!(attempts("load-balancer"), 3);
        assert_eq!(attempts("listener"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_security_group_does_not_wait_for_hostname() {
        let (with, backend) = collaborators(kube(4), platform(1, false));
        let (plan, _) = blueprint(settings(), &with);

        let report = plan.finish().unwrap().run().await;
        assert_eq!(report.outcome(), Outcome::Completed);

        let sg = report.node("vpc-link-sg").unwrap().execution.clone().unwrap();
        let integration = report.node("gateway-integration").unwrap().execution.clone().unwrap();
        let hostname = report.lookups.iter().find(|l| &*l.label == "ingress-hostname").unwrap();

        // The hostname needs three backoff delays, the security group none.
        assert!(sg.start + sg.duration < integration.start);
        assert!(hostname.duration >= Duration::from_secs(8));
        assert!(backend.position("securityGroup").unwrap() < backend.position("Integration").unwrap());
        assert!(backend.position("securityGroup").unwrap() < backend.position("helm").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_lookup_fails_only_gateway_branch() {
        let (with, backend) = collaborators(kube(1), platform(1, true));
        let (plan, stack) = blueprint(settings(), &with);

        let report = plan.finish().unwrap().run().await;

        assert_eq!(report.outcome(), Outcome::Failed);
        let branches = report.failed_branches();
        assert_eq!(branches.len(), 1);
        assert_eq!(&*branches[0].origin, "load-balancer");
        assert!(matches!(branches[0].failure.cause(), Cause::LookupPermanent(LookupError::PermissionDenied(_))));

        let failed: Vec<&str> = branches[0].nodes.iter().map(|n| n.as_ref()).collect();
        assert_eq!(
            failed,
            vec!["gateway-integration", "authorizer", "routes", "deployment", "stage"]
        );
        for name in ["ingress", "argocd-app", "vpc-link-sg", "vpc-link", "api"] {
            assert_eq!(report.state_of(name), Some(NodeState::Completed), "{name}");
        }
        assert!(stack.listener.failure().is_some());
        assert!(backend.position("Integration").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hostname_that_never_appears_times_out() {
        let (with, backend) = collaborators(kube(u32::MAX), platform(1, false));
        let mut settings = settings();
        settings.timeout = Some(Duration::from_secs(30));
        settings.lookup = RetryPolicy::with_max_attempts(u32::MAX);
        let (plan, stack) = blueprint(settings, &with);

        let report = plan.finish().unwrap().run().await;

        assert!(report.timed_out);
        let failure = stack.load_balancer_name.failure().unwrap();
        assert!(failure.is_timeout());
        assert_eq!(failure.origin(), "ingress-hostname");

        let branches = report.failed_branches();
        assert_eq!(branches.len(), 1);
        assert!(branches[0].failure.same_as(&failure));
        assert_eq!(report.state_of("stage"), Some(NodeState::Failed));
        assert_eq!(report.state_of("argocd-app"), Some(NodeState::Completed));
        assert_eq!(report.state_of("vpc-link"), Some(NodeState::Completed));
        assert!(backend.position("Authorizer").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_is_installed_before_ingress() {
        let (with, backend) = collaborators(kube(1), platform(1, false));
        let (plan, _) = blueprint(settings(), &with);

        let report = plan.finish().unwrap().run().await;
        assert_eq!(report.outcome(), Outcome::Completed, "{report}");

        let chart = report.node("lb-controller-chart").unwrap().execution.clone().unwrap();
        let ingress = report.node("ingress").unwrap().execution.clone().unwrap();
        assert!(chart.start + chart.duration <= ingress.start);

        let role = backend.spec("aws:iam/role:Role").unwrap();
        let statement = &role.properties["assumeRolePolicy"]["Statement"][0];
        assert_eq!(statement["Principal"]["Federated"], OIDC_ARN);
        assert_eq!(
            statement["Condition"]["StringEquals"]["oidc.eks.ca-central-1.amazonaws.com/id/EXAMPLE:sub"],
            "system:serviceaccount:kube-system:lb-aws-load-balancer-controller"
        );

        let attachment = backend.spec("aws:iam/rolePolicyAttachment:RolePolicyAttachment").unwrap();
        assert_eq!(attachment.properties["role"], "veridid-lb-controller-role");
        assert_eq!(attachment.properties["policyArn"], "arn:aws:iam::123:veridid-lb-controller-policy-id");

        let chart = backend
            .created()
            .into_iter()
            .find(|spec| spec.properties["chart"] == "aws-load-balancer-controller")
            .unwrap();
        let values = &chart.properties["values"];
        assert_eq!(
            values["serviceAccount"]["annotations"]["eks.amazonaws.com/role-arn"],
            "arn:aws:iam::123:veridid-lb-controller-role-id"
        );
        assert_eq!(values["vpcId"], "vpc-1");
        assert_eq!(values["clusterName"], "veridid-cluster");

        // Five subnets, eight tags each.
        let tags: Vec<ResourceSpec> = backend
            .created()
            .into_iter()
            .filter(|spec| spec.kind == "aws:ec2/tag:Tag")
            .collect();
        assert_eq!(tags.len(), 40);
        assert!(tags.iter().any(|tag| tag.properties["resourceId"] == "subnet-d"
            && tag.properties["key"] == "kubernetes.io/role/elb"
            && tag.properties["value"] == "1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_oidc_provider_fails_controller_branch() {
        let backend = Backend {
            without_oidc: true,
            ..Default::default()
        };
        let (with, backend) = with_backend(backend, Arc::new(kube(1)), platform(1, false));
        let (plan, stack) = blueprint(settings(), &with);

        let report = plan.finish().unwrap().run().await;

        assert_eq!(report.outcome(), Outcome::Failed);
        let branches = report.failed_branches();
        assert_eq!(branches.len(), 1);
        assert_eq!(&*branches[0].origin, "cluster-oidc");
        assert!(matches!(branches[0].failure.cause(), Cause::Derivation(_)));

        for name in ["lb-controller-role", "lb-controller-chart", "ingress", "gateway-integration", "stage"] {
            assert_eq!(report.state_of(name), Some(NodeState::Failed), "{name}");
        }
        for name in ["cluster", "subnet-tags", "argocd-app", "api", "vpc-link-sg", "vpc-link"] {
            assert_eq!(report.state_of(name), Some(NodeState::Completed), "{name}");
        }
        assert!(stack.load_balancer_name.failure().unwrap().same_as(&branches[0].failure));
        assert!(backend.position("iam/role").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_secret_carries_encoded_auth() {
        let kube = Arc::new(kube(1));
        let (with, _) = with_backend(Backend::default(), kube.clone(), platform(1, false));
        let (plan, _) = blueprint(settings(), &with);

        let report = plan.finish().unwrap().run().await;
        assert_eq!(report.outcome(), Outcome::Completed, "{report}");

        let secret = kube.applied("ghcr-secret").unwrap();
        let config = secret.body["stringData"][".dockerconfigjson"].as_str().unwrap();
        let config: Value = serde_json::from_str(config).unwrap();
        let auth = config["auths"]["ghcr.io"]["auth"].as_str().unwrap();

        assert_eq!(auth, "dmVyaWRpZDp0b2tlbg==");
        assert_eq!(STANDARD.decode(auth).unwrap(), b"veridid:token");
    }
}
