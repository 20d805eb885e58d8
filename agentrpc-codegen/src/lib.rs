use heck::{ToShoutySnakeCase, ToSnakeCase};
use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use std::collections::BTreeMap;
use syn::{LitStr, Token, parse::Parse, parse::ParseStream, parse_macro_input};

/// Options for the rpc_gen! macro
struct GenOptions {
    client: bool,
    server: bool,
}

/// Custom parser for macro arguments
struct GenInput {
    schema_path: LitStr,
    options: Vec<(syn::Ident, syn::Lit)>,
}

impl Parse for GenInput {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let schema_path: LitStr = input.parse()?;
        let mut options = Vec::new();

        while !input.is_empty() {
            input.parse::<Token![,]>()?;
            if input.is_empty() {
                break;
            }
            let key: syn::Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            let value: syn::Lit = input.parse()?;
            options.push((key, value));
        }

        Ok(GenInput {
            schema_path,
            options,
        })
    }
}

/// Service schema parsed from YAML.
///
/// Maps are ordered so that every crate compiling the same schema lays out
/// struct fields, and therefore the bincode encoding, identically.
#[derive(Debug, serde::Deserialize)]
struct ServiceDefinition {
    service: String,
    methods: BTreeMap<String, MethodDefinition>,
}

#[derive(Debug, serde::Deserialize)]
struct MethodDefinition {
    #[serde(default)]
    request: BTreeMap<String, String>,
    #[serde(default)]
    response: BTreeMap<String, String>,
}

/// Generates typed request/response structs, a client and a server adapter
/// for the service described by a YAML schema.
///
/// ```ignore
/// agentrpc::rpc_gen!("schema/appliance_agent.yaml", client = true, server = true, module = "appliance_agent");
/// ```
///
/// The path is resolved against the calling crate's `CARGO_MANIFEST_DIR`.
#[proc_macro]
pub fn rpc_gen(input: TokenStream) -> TokenStream {
    let gen_input = parse_macro_input!(input as GenInput);

    let schema_path = gen_input.schema_path.value();
    let mut options = GenOptions {
        client: true,
        server: true,
    };
    let mut module: Option<String> = None;

    for (key, value) in gen_input.options {
        match (key.to_string().as_str(), value) {
            ("client", syn::Lit::Bool(lit_bool)) => options.client = lit_bool.value(),
            ("server", syn::Lit::Bool(lit_bool)) => options.server = lit_bool.value(),
            ("module", syn::Lit::Str(lit_str)) => module = Some(lit_str.value()),
            (other, _) => {
                return syn::Error::new_spanned(
                    key,
                    format!(
                        "Unknown or mistyped option '{}' (expected client = bool, server = bool, module = \"name\")",
                        other
                    ),
                )
                .to_compile_error()
                .into();
            }
        }
    }

    let full_path = if std::path::Path::new(&schema_path).is_absolute() {
        std::path::PathBuf::from(&schema_path)
    } else {
        let manifest_dir =
            std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
        std::path::Path::new(&manifest_dir).join(&schema_path)
    };

    let schema = match std::fs::read_to_string(&full_path) {
        Ok(content) => content,
        Err(e) => {
            return syn::Error::new_spanned(
                &gen_input.schema_path,
                format!(
                    "Failed to read schema '{}' (tried '{}'): {}",
                    schema_path,
                    full_path.display(),
                    e
                ),
            )
            .to_compile_error()
            .into();
        }
    };

    let service_def: ServiceDefinition = match serde_yaml::from_str(&schema) {
        Ok(def) => def,
        Err(e) => {
            return syn::Error::new_spanned(
                &gen_input.schema_path,
                format!("Failed to parse schema: {}", e),
            )
            .to_compile_error()
            .into();
        }
    };

    let module_name = module.unwrap_or_else(|| service_def.service.to_snake_case());
    let module_ident = ident(&module_name);
    let generated_code = match generate_code(&service_def, &options) {
        Ok(code) => code,
        Err(e) => {
            return syn::Error::new_spanned(
                &gen_input.schema_path,
                format!("Invalid schema '{}': {}", schema_path, e),
            )
            .to_compile_error()
            .into();
        }
    };

    let output = quote! {
        pub mod #module_ident {
            #generated_code
        }
    };

    output.into()
}

fn ident(name: &str) -> syn::Ident {
    syn::Ident::new(name, Span::call_site())
}

fn method_const(method_name: &str) -> syn::Ident {
    ident(&format!("METHOD_{}", method_name.to_shouty_snake_case()))
}

fn request_ident(method_name: &str) -> syn::Ident {
    ident(&format!("{}Request", method_name))
}

fn response_ident(method_name: &str) -> syn::Ident {
    ident(&format!("{}Response", method_name))
}

fn generate_code(
    service_def: &ServiceDefinition,
    options: &GenOptions,
) -> syn::Result<proc_macro2::TokenStream> {
    let constants = generate_constants(service_def);
    let structs = generate_request_response_structs(service_def)?;
    let client = if options.client {
        generate_client_code(service_def)
    } else {
        quote! {}
    };
    let server = if options.server {
        generate_server_code(service_def)
    } else {
        quote! {}
    };

    Ok(quote! {
        #constants
        #structs
        #client
        #server
    })
}

/// Service and method names as they appear on the wire.
fn generate_constants(service_def: &ServiceDefinition) -> proc_macro2::TokenStream {
    let service_name = &service_def.service;

    let method_constants = service_def.methods.keys().map(|method_name| {
        let const_ident = method_const(method_name);
        quote! {
            pub const #const_ident: &str = #method_name;
        }
    });

    quote! {
        pub const SERVICE_NAME: &str = #service_name;
        #(#method_constants)*
    }
}

fn generate_fields(
    fields: &BTreeMap<String, String>,
) -> syn::Result<Vec<proc_macro2::TokenStream>> {
    fields
        .iter()
        .map(|(field_name, field_type)| {
            let field_ident: syn::Ident = syn::parse_str(field_name).map_err(|e| {
                syn::Error::new(e.span(), format!("invalid field name `{}`", field_name))
            })?;
            let field_type = parse_type(field_type).map_err(|e| {
                syn::Error::new(
                    e.span(),
                    format!("field `{}` has invalid type `{}`: {}", field_name, field_type, e),
                )
            })?;
            Ok(quote! {
                pub #field_ident: #field_type
            })
        })
        .collect()
}

fn generate_request_response_structs(
    service_def: &ServiceDefinition,
) -> syn::Result<proc_macro2::TokenStream> {
    let mut structs = Vec::with_capacity(service_def.methods.len());
    for (method_name, method_def) in &service_def.methods {
        let request_name = request_ident(method_name);
        let response_name = response_ident(method_name);
        let request_fields = generate_fields(&method_def.request)?;
        let response_fields = generate_fields(&method_def.response)?;

        structs.push(quote! {
            #[derive(Debug, Clone, PartialEq, ::agentrpc::serde::Serialize, ::agentrpc::serde::Deserialize)]
            #[serde(crate = "::agentrpc::serde")]
            pub struct #request_name {
                #(#request_fields),*
            }

            #[derive(Debug, Clone, PartialEq, ::agentrpc::serde::Serialize, ::agentrpc::serde::Deserialize)]
            #[serde(crate = "::agentrpc::serde")]
            pub struct #response_name {
                #(#response_fields),*
            }
        });
    }

    Ok(quote! {
        #(#structs)*
    })
}

fn generate_client_code(service_def: &ServiceDefinition) -> proc_macro2::TokenStream {
    let client_name = ident(&format!("{}Client", service_def.service));

    let methods = service_def.methods.keys().map(|method_name| {
        let method_ident = ident(&method_name.to_snake_case());
        let const_ident = method_const(method_name);
        let request_type = request_ident(method_name);
        let response_type = response_ident(method_name);

        quote! {
            pub async fn #method_ident(&self, request: #request_type) -> ::agentrpc::Result<#response_type> {
                let response = self
                    .inner
                    .call(SERVICE_NAME, #const_ident, ::agentrpc::encode_payload(request)?)
                    .await?;

                ::agentrpc::decode_payload::<#response_type>(response)
            }
        }
    });

    quote! {
        pub struct #client_name {
            inner: ::std::sync::Arc<::agentrpc::client::RPCClient>,
        }

        impl #client_name {
            pub async fn try_new(address: String) -> ::agentrpc::Result<Self> {
                let inner = ::agentrpc::client::RPCClientBuilder::new()
                    .address(address)
                    .build()
                    .await?;
                Ok(Self { inner })
            }

            /// Connects with `timeout` bounding the connect and every call.
            pub async fn connect(address: String, timeout: ::std::time::Duration) -> ::agentrpc::Result<Self> {
                let inner = ::agentrpc::client::RPCClientBuilder::new()
                    .address(address)
                    .timeout(timeout)
                    .build()
                    .await?;
                Ok(Self { inner })
            }

            pub fn from_client(inner: ::std::sync::Arc<::agentrpc::client::RPCClient>) -> Self {
                Self { inner }
            }

            pub async fn close(&self) -> ::agentrpc::Result<()> {
                self.inner.shutdown().await
            }

            #(#methods)*
        }
    }
}

fn generate_server_code(service_def: &ServiceDefinition) -> proc_macro2::TokenStream {
    let service_trait_name = ident(&format!("{}Service", service_def.service));
    let server_name = ident(&format!("{}Server", service_def.service));

    let trait_methods = service_def.methods.keys().map(|method_name| {
        let method_ident = ident(&method_name.to_snake_case());
        let request_type = request_ident(method_name);
        let response_type = response_ident(method_name);

        quote! {
            async fn #method_ident(&self, request: #request_type) -> ::agentrpc::Result<#response_type>;
        }
    });

    let handler_registrations = service_def.methods.keys().map(|method_name| {
        let method_ident = ident(&method_name.to_snake_case());
        let const_ident = method_const(method_name);
        let request_type = request_ident(method_name);

        quote! {
            {
                let inner = self.inner.clone();
                server.register_service(
                    SERVICE_NAME.to_string(),
                    #const_ident.to_string(),
                    Box::new(move |payload: Vec<u8>| {
                        let inner = inner.clone();
                        Box::pin(async move {
                            let request = ::agentrpc::decode_payload::<#request_type>(payload)
                                .map_err(|e| ::agentrpc::RPCStatus::new(
                                    ::agentrpc::StatusCode::InvalidArgument,
                                    format!("Failed to decode request: {}", e),
                                ))?;
                            let response = inner.#method_ident(request).await.map_err(|e| {
                                ::agentrpc::RPCStatus::new(::agentrpc::StatusCode::Internal, e.to_string())
                            })?;
                            ::agentrpc::encode_payload(response).map_err(|e| {
                                ::agentrpc::RPCStatus::new(
                                    ::agentrpc::StatusCode::Internal,
                                    format!("Failed to encode response: {}", e),
                                )
                            })
                        })
                    }),
                );
            }
        }
    });

    quote! {
        #[::agentrpc::async_trait]
        pub trait #service_trait_name: Send + Sync + 'static {
            #(#trait_methods)*
        }

        pub struct #server_name<T: #service_trait_name> {
            inner: ::std::sync::Arc<T>,
        }

        impl<T: #service_trait_name> #server_name<T> {
            pub fn new(service: T) -> Self {
                Self {
                    inner: ::std::sync::Arc::new(service),
                }
            }

            pub fn register(&self, server: &mut ::agentrpc::server::RPCServer) {
                #(#handler_registrations)*
            }
        }
    }
}

/// Parses a schema type such as `u32`, `Vec<String>` or `std::string::String`.
fn parse_type(type_str: &str) -> syn::Result<syn::Type> {
    syn::parse_str(type_str.trim())
}
